//! buffering and commit of multi-fragment gatt writes

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::debug;

/// accumulates prepared-write fragments per transaction and commits finished
/// names onto the received-names log
///
/// open transactions with no matching execute keep their buffer for the
/// session lifetime; the protocol has no transaction timeout.
pub(crate) struct WriteReassembler {
    pending: HashMap<u32, Vec<u8>>,
    names: watch::Sender<Vec<String>>,
}

impl WriteReassembler {
    pub(crate) fn new(names: watch::Sender<Vec<String>>) -> Self {
        Self {
            pending: HashMap::new(),
            names,
        }
    }

    /// open or extend the buffer for a transaction. fragments are trusted as
    /// delivered; there is no length or checksum validation.
    pub(crate) fn append(&mut self, transaction: u32, fragment: &[u8]) {
        let buffer = self.pending.entry(transaction).or_default();
        buffer.extend_from_slice(fragment);
        debug!(
            "write tx {transaction}: buffered {} byte(s), {} total",
            fragment.len(),
            buffer.len()
        );
    }

    /// single-shot write, committed with no buffering step
    pub(crate) fn commit_immediate(&mut self, value: &[u8]) {
        self.push_name(value);
    }

    /// close a transaction: commit appends the buffered name, abort discards
    /// it. an unknown transaction is a no-op since duplicate or out-of-order
    /// executes can arrive from the transport.
    pub(crate) fn execute(&mut self, transaction: u32, commit: bool) {
        match self.pending.remove(&transaction) {
            Some(buffer) if commit => self.push_name(&buffer),
            Some(_) => debug!("write tx {transaction}: aborted"),
            None => {}
        }
    }

    #[cfg(test)]
    fn is_pending(&self, transaction: u32) -> bool {
        self.pending.contains_key(&transaction)
    }

    fn push_name(&self, value: &[u8]) {
        // the protocol carries no encoding information, so invalid utf-8 is
        // kept with replacement characters rather than dropped
        let name = String::from_utf8_lossy(value).into_owned();
        debug!("name received: {name:?}");
        self.names.send_modify(|log| log.push(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> (WriteReassembler, watch::Receiver<Vec<String>>) {
        let (tx, rx) = watch::channel(Vec::new());
        (WriteReassembler::new(tx), rx)
    }

    #[test]
    fn fragments_commit_as_one_name_in_arrival_order() {
        let (mut reassembler, names) = reassembler();
        reassembler.append(1, b"foo");
        reassembler.append(1, b"bar");
        assert!(names.borrow().is_empty());
        reassembler.execute(1, true);
        assert_eq!(*names.borrow(), vec!["foobar".to_string()]);
        assert!(!reassembler.is_pending(1));
    }

    #[test]
    fn execute_for_unknown_transaction_is_a_noop() {
        let (mut reassembler, names) = reassembler();
        reassembler.execute(99, true);
        reassembler.execute(99, false);
        assert!(names.borrow().is_empty());
    }

    #[test]
    fn abort_discards_the_buffer() {
        let (mut reassembler, names) = reassembler();
        reassembler.append(2, b"x");
        reassembler.execute(2, false);
        assert!(names.borrow().is_empty());
        assert!(!reassembler.is_pending(2));
        // a later duplicate execute finds nothing and stays silent
        reassembler.execute(2, true);
        assert!(names.borrow().is_empty());
    }

    #[test]
    fn transactions_do_not_interfere() {
        let (mut reassembler, names) = reassembler();
        reassembler.append(1, b"alice");
        reassembler.append(2, b"bob");
        reassembler.execute(1, true);
        assert_eq!(*names.borrow(), vec!["alice".to_string()]);
        assert!(reassembler.is_pending(2));
        reassembler.execute(2, true);
        assert_eq!(*names.borrow(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn immediate_commit_skips_buffering() {
        let (mut reassembler, names) = reassembler();
        reassembler.commit_immediate(b"carol");
        assert_eq!(*names.borrow(), vec!["carol".to_string()]);
    }

    #[test]
    fn invalid_utf8_is_kept_lossily() {
        let (mut reassembler, names) = reassembler();
        reassembler.commit_immediate(&[0x66, 0xff, 0x6f]);
        assert_eq!(*names.borrow(), vec!["f\u{fffd}o".to_string()]);
    }
}
