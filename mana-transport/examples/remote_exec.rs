//! Run one command over an SSH session tunneled through a mana.v1
//! gateway:
//!
//! ```sh
//! cargo run --example remote_exec -- ws://localhost:8022/term demo uptime
//! ```
//!
//! The demo signs with a fixed throwaway key; real embedders inject an
//! [`Identity`] backed by their own key handling.

use ed25519_dalek::SigningKey;
use mana_ssh::auth::Identity;
use mana_ssh::{ChannelRequest, ClientSession, Intent, SessionConfig, SessionEvent};
use mana_transport::conduit::{ConduitCommand, SshConduit};
use mana_transport::flow::FlowConfig;
use mana_transport::framer::FramerConfig;
use mana_transport::resume::MemoryResumeStore;
use mana_transport::websocket::WsBinding;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://127.0.0.1:8022/term".into());
    let user = args.next().unwrap_or_else(|| "demo".into());
    let command = args.next().unwrap_or_else(|| "uptime".into());

    let mut config = SessionConfig::default();
    config.identity = Some(Identity::from_signing_key(
        user,
        SigningKey::from_bytes(&[0x4d; 32]),
    ));

    let session = ClientSession::new(config)?;
    let binding = WsBinding::connect(&url).await?;
    let mut handles = SshConduit::spawn(
        session,
        binding,
        FramerConfig::new("remote-exec", &url),
        FlowConfig::default(),
        Box::new(MemoryResumeStore::default()),
    );

    while let Some(event) = handles.event_rx.recv().await {
        match event {
            SessionEvent::AuthSuccess => {
                handles
                    .command_tx
                    .send(ConduitCommand::Intent(Intent::OpenChannel {
                        channel_type: "session".into(),
                        initial_window_size: None,
                        max_packet_size: None,
                    }))?;
            }
            SessionEvent::AuthFailure { methods, .. } => {
                anyhow::bail!("authentication rejected; server offers {methods:?}");
            }
            SessionEvent::ChannelOpen { id, .. } => {
                handles
                    .command_tx
                    .send(ConduitCommand::Intent(Intent::RequestChannel {
                        id,
                        request: ChannelRequest::Exec {
                            command: command.clone(),
                        },
                        want_reply: true,
                    }))?;
            }
            SessionEvent::ChannelData { data, .. } => {
                print!("{}", String::from_utf8_lossy(&data));
            }
            SessionEvent::ChannelExitStatus { status, .. } => {
                eprintln!("exit status {status}");
            }
            SessionEvent::ChannelClose { .. } | SessionEvent::Disconnect { .. } => {
                break;
            }
            _ => {}
        }
    }

    handles.command_tx.send(ConduitCommand::Close)?;
    let _ = handles.task.await;
    Ok(())
}
