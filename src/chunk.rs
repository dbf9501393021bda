//! payload splitting for the chunked read protocol

use bytes::Bytes;

/// default number of body bytes per fragment, not counting the index prefix
/// or the terminal marker
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// marker appended to the final fragment's body with no separator
pub const END_OF_MESSAGE: &[u8] = b"EOM";

/// one ordered piece of a split payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: usize,
    pub body: Bytes,
    pub is_last: bool,
}

impl Fragment {
    /// wire frame: `"<index>/<body>"`, the last fragment suffixed `EOM`
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(8 + self.body.len() + END_OF_MESSAGE.len());
        out.extend_from_slice(self.index.to_string().as_bytes());
        out.push(b'/');
        out.extend_from_slice(&self.body);
        if self.is_last {
            out.extend_from_slice(END_OF_MESSAGE);
        }
        Bytes::from(out)
    }
}

/// split a payload into fragments of at most `chunk_size` body bytes,
/// contiguous and in index order
///
/// a payload length that is an exact multiple of `chunk_size` (the empty
/// payload included) still ends with an empty terminal fragment, so the
/// marker appears exactly once, on the fragment at the last index
pub fn split(payload: &[u8], chunk_size: usize) -> Vec<Fragment> {
    let chunk_size = chunk_size.max(1);
    let mut fragments: Vec<Fragment> = payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| Fragment {
            index,
            body: Bytes::copy_from_slice(chunk),
            is_last: false,
        })
        .collect();
    if payload.len() % chunk_size == 0 {
        fragments.push(Fragment {
            index: fragments.len(),
            body: Bytes::new(),
            is_last: false,
        });
    }
    if let Some(last) = fragments.last_mut() {
        last.is_last = true;
    }
    fragments
}
