// serve a credential document over ble and print names written back
use anyhow::Result;
use ble_courier::{BlePeripheralTransport, GattPeripheralSession, SessionConfig};

const PAYLOAD: &str = r#"{"presentation":{"type":"verifiablePresentation","id":"did:courier:demo-holder","credential":{"type":"verifiableCredential","issuer":{"name":"Example University","id":"did:courier:demo-issuer"},"issuanceDate":"1705900000","expirationDate":"1706900000","credentialSubjects":{"id":"did:courier:demo-holder","name":"Demo Student","subjects":[{"document":{"name":"Student ID","contents":[{"key":"name","value":"Demo Student"},{"key":"number","value":"2018380355"},{"key":"department","value":"Computer Science"},{"key":"enrolled","value":"2018.03"}]}}]},"proof":{"signatureAlgorithm":"secp256k1","created":"1705900000","creatorID":"did:courier:demo-issuer","jws":"MEUCIQCKWDIAJQbnt"}},"proof":{"signatureAlgorithm":"secp256k1","created":"1706000000","creatorID":"did:courier:demo-holder","jws":"MEQCIBrDHgn7jXQkQZom2Nywb"}}}"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let transport = BlePeripheralTransport::new().await?;
    let session = GattPeripheralSession::new(
        Box::new(transport),
        SessionConfig::new("ble-courier", PAYLOAD),
    );
    session.start().await?;
    println!("serving a {} byte payload, ctrl-c to stop", PAYLOAD.len());

    let mut state = session.state();
    let mut names = session.names();
    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                changed?;
                println!("session state: {:?}", *state.borrow_and_update());
            }
            changed = names.changed() => {
                changed?;
                let log = names.borrow_and_update().clone();
                for name in &log[seen..] {
                    println!("name received: {name}");
                }
                seen = log.len();
            }
        }
    }

    session.stop().await?;
    Ok(())
}
