//! End-to-end reducer scenarios against a scripted in-test server.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use mana_ssh::auth::{self, Identity};
use mana_ssh::cipher::GcmDirection;
use mana_ssh::codec::{Encoding, Reader};
use mana_ssh::crypto::kdf::derive_key_material;
use mana_ssh::crypto::{CryptoProvider, ScriptedEntropy, StackProvider};
use mana_ssh::kex::{self, HashField};
use mana_ssh::msg;
use mana_ssh::{
    ChannelRequest, ChannelStatus, Intent, SessionConfig, SessionEvent, SessionPhase,
};
use num_bigint::BigUint;

const CLIENT_ID: &str = "SSH-2.0-test_0.1";
const SERVER_ID: &str = "SSH-2.0-OpenSSH_9.6";

// RFC 7748 §5.2 scalar `b`, the server's fixed ephemeral secret.
const SCALAR_B: [u8; 32] = [
    0x5d, 0xab, 0x08, 0x7e, 0x62, 0x4a, 0x8a, 0x4b, 0x79, 0xe1, 0x7f, 0x8b, 0x83, 0x80, 0x0e,
    0xe6, 0x6f, 0x3b, 0xb1, 0x29, 0x26, 0x18, 0xb6, 0xfd, 0x1c, 0x2f, 0x8b, 0x27, 0xff, 0x88,
    0xe0, 0xeb,
];

fn config_with_entropy(entropy_script: &[u8]) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.identification.client_id = CLIENT_ID.to_owned();
    config.entropy = Box::new(ScriptedEntropy::new(entropy_script));
    config.identity = Some(Identity::from_signing_key(
        "operator",
        SigningKey::from_bytes(&[0x42; 32]),
    ));
    config
}

/// Fixed client entropy feeding the KEXINIT cookie, packet padding and
/// the ephemeral kex secret. The exact bytes are irrelevant (the test
/// server derives everything from the public values it observes), but a
/// fixed script keeps every run identical.
fn client_entropy_script() -> Vec<u8> {
    vec![0x5c; 8192]
}

fn plain_packet(payload: &[u8]) -> Vec<u8> {
    let mut padding = 8 - ((1 + payload.len()) % 8);
    if padding < 4 {
        padding += 8;
    }
    while 4 + 1 + payload.len() + padding < 16 {
        padding += 8;
    }
    let mut wire = Vec::new();
    wire.push_u32_be((1 + payload.len() + padding) as u32);
    wire.push(padding as u8);
    wire.extend_from_slice(payload);
    wire.extend(std::iter::repeat(0u8).take(padding));
    wire
}

fn parse_plain(wire: &[u8]) -> Vec<u8> {
    let mut r = Reader::new(wire);
    let packet_length = r.read_u32().unwrap() as usize;
    let padding = r.read_byte().unwrap() as usize;
    r.read_bytes(packet_length - 1 - padding).unwrap().to_vec()
}

fn server_kexinit(kex_names: &[&str]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(msg::KEXINIT);
    payload.extend_from_slice(&[0x99u8; 16]);
    payload.extend_list(kex_names.iter());
    payload.extend_list(["ssh-ed25519"].iter());
    payload.extend_list(["aes128-gcm@openssh.com"].iter());
    payload.extend_list(["aes128-gcm@openssh.com"].iter());
    payload.extend_list(["hmac-sha2-256", "AEAD_AES_128_GCM"].iter());
    payload.extend_list(["hmac-sha2-256", "AEAD_AES_128_GCM"].iter());
    payload.extend_list(["none"].iter());
    payload.extend_list(["none"].iter());
    payload.write_empty_list();
    payload.write_empty_list();
    payload.push(0);
    payload.extend_from_slice(&[0, 0, 0, 0]);
    payload
}

/// The scripted server: replays the key exchange from its side and keeps
/// both AES-GCM directions so the test can read client packets and write
/// server packets.
struct TestServer {
    provider: StackProvider,
    host_key: SigningKey,
    seal: Option<GcmDirection>,
    open: Option<GcmDirection>,
}

impl TestServer {
    fn new() -> Self {
        TestServer {
            provider: StackProvider,
            host_key: SigningKey::from_bytes(&[7u8; 32]),
            seal: None,
            open: None,
        }
    }

    fn host_key_blob(&self) -> Vec<u8> {
        auth::public_key_blob("ssh-ed25519", &self.host_key.verifying_key().to_bytes())
    }

    fn derive_directions(&mut self, shared_magnitude: &[u8], exchange_hash: &[u8; 32]) {
        let field = kex::shared_mpint_field(shared_magnitude);
        let derive = |letter: u8, len: usize| {
            derive_key_material(&self.provider, &field, exchange_hash, letter, exchange_hash, len)
        };
        let iv_c2s = derive(b'A', 12);
        let iv_s2c = derive(b'B', 12);
        let key_c2s = derive(b'C', 16);
        let key_s2c = derive(b'D', 16);
        self.open = Some(GcmDirection::from_key_material(&key_c2s, &iv_c2s, 0).unwrap());
        self.seal = Some(GcmDirection::from_key_material(&key_s2c, &iv_s2c, 0).unwrap());
    }

    /// Answer a curve25519 KEX_ECDH_INIT: reply payload plus NEWKEYS.
    fn answer_curve25519(
        &mut self,
        client_kexinit: &[u8],
        ecdh_init: &[u8],
        server_kexinit_payload: &[u8],
    ) -> Vec<u8> {
        let mut r = Reader::starting_at(ecdh_init, 1);
        let client_public: [u8; 32] = r.read_string().unwrap().try_into().unwrap();

        let server_public = self.provider.x25519_base(&SCALAR_B).unwrap();
        let shared = self.provider.x25519(&SCALAR_B, &client_public).unwrap();
        let magnitude = kex::curve25519_shared_magnitude(&shared);

        let host_key_blob = self.host_key_blob();
        let hash = kex::exchange_hash(
            &self.provider,
            CLIENT_ID,
            SERVER_ID,
            client_kexinit,
            server_kexinit_payload,
            &host_key_blob,
            HashField::Str(&client_public),
            HashField::Str(&server_public),
            &magnitude,
        );
        let signature = self.host_key.sign(&hash).to_bytes();
        self.derive_directions(&magnitude, &hash);

        let mut reply = Vec::new();
        reply.push(msg::KEX_ECDH_REPLY);
        reply.extend_ssh_string(&host_key_blob);
        reply.extend_ssh_string(&server_public);
        reply.extend_ssh_string(&auth::signature_blob("ssh-ed25519", &signature));

        let mut wire = plain_packet(&reply);
        wire.extend_from_slice(&plain_packet(&[msg::NEWKEYS]));
        wire
    }

    /// Answer a group14 KEXDH_INIT.
    fn answer_group14(
        &mut self,
        client_kexinit: &[u8],
        kexdh_init: &[u8],
        server_kexinit_payload: &[u8],
    ) -> Vec<u8> {
        let mut r = Reader::starting_at(kexdh_init, 1);
        let e = BigUint::from_bytes_be(r.read_mpint().unwrap());

        let y = kex::group14::derive_exponent(&[0xd4u8; 32]);
        let f = kex::group14::public_value(&y);
        let shared = kex::group14::shared_secret(&e, &y).unwrap();
        let magnitude = shared.to_bytes_be();

        let e_bytes = e.to_bytes_be();
        let f_bytes = f.to_bytes_be();
        let host_key_blob = self.host_key_blob();
        let hash = kex::exchange_hash(
            &self.provider,
            CLIENT_ID,
            SERVER_ID,
            client_kexinit,
            server_kexinit_payload,
            &host_key_blob,
            HashField::Mpint(&e_bytes),
            HashField::Mpint(&f_bytes),
            &magnitude,
        );
        let signature = self.host_key.sign(&hash).to_bytes();
        self.derive_directions(&magnitude, &hash);

        let mut reply = Vec::new();
        reply.push(msg::KEXDH_REPLY);
        reply.extend_ssh_string(&host_key_blob);
        reply.extend_ssh_mpint(&f_bytes);
        reply.extend_ssh_string(&auth::signature_blob("ssh-ed25519", &signature));

        let mut wire = plain_packet(&reply);
        wire.extend_from_slice(&plain_packet(&[msg::NEWKEYS]));
        wire
    }

    /// Seal a server-to-client packet post-NEWKEYS.
    fn seal_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut entropy = ScriptedEntropy::new(&[0x55; 64]);
        self.seal
            .as_mut()
            .unwrap()
            .seal(&self.provider, &mut entropy, payload)
            .unwrap()
    }

    /// Open a client-to-server packet post-NEWKEYS.
    fn open_packet(&mut self, wire: &[u8]) -> Vec<u8> {
        self.open
            .as_mut()
            .unwrap()
            .open(&self.provider, wire)
            .unwrap()
    }
}

fn drain_events(session: &mut mana_ssh::ClientSession) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = session.next_event() {
        events.push(event);
    }
    events
}

fn event_names(events: &[SessionEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            SessionEvent::IdentificationSent { .. } => "identification-sent",
            SessionEvent::IdentificationReceived { .. } => "identification-received",
            SessionEvent::KexInitSent => "kex-init-sent",
            SessionEvent::KexInitReceived => "kex-init-received",
            SessionEvent::KeysEstablished { .. } => "keys-established",
            SessionEvent::OutboundData { .. } => "outbound-data",
            SessionEvent::AuthBanner { .. } => "auth-banner",
            SessionEvent::AuthPrompt { .. } => "auth-prompt",
            SessionEvent::AuthSuccess => "auth-success",
            SessionEvent::AuthFailure { .. } => "auth-failure",
            SessionEvent::ChannelOpen { .. } => "channel-open",
            SessionEvent::ChannelData { .. } => "channel-data",
            SessionEvent::ChannelWindowAdjust { .. } => "channel-window-adjust",
            SessionEvent::ChannelRequestOutcome { .. } => "channel-request",
            SessionEvent::ChannelEof { .. } => "channel-eof",
            SessionEvent::ChannelClose { .. } => "channel-close",
            SessionEvent::ChannelExitStatus { .. } => "channel-exit-status",
            SessionEvent::ChannelExitSignal { .. } => "channel-exit-signal",
            SessionEvent::GlobalRequest { .. } => "global-request",
            SessionEvent::Disconnect { .. } => "disconnect",
            SessionEvent::Warning { .. } => "warning",
        })
        .collect()
}

/// Drive a session through identification, kex and userauth against the
/// scripted server. Returns the session, the server, and the local
/// channel id counter starting point.
fn establish(kex_names: &[&str]) -> (mana_ssh::ClientSession, TestServer) {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    let mut server = TestServer::new();

    // Identification + server KEXINIT.
    let server_kexinit_payload = server_kexinit(kex_names);
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    session
        .receive(&plain_packet(&server_kexinit_payload))
        .unwrap();
    assert_eq!(session.phase(), SessionPhase::Kex);

    // The client queued: KEXINIT, then its kex init message.
    let outbound = session.flush_outbound();
    assert_eq!(outbound.len(), 2);
    let client_kexinit = parse_plain(&outbound[0]);
    let kex_init_msg = parse_plain(&outbound[1]);

    let reply = if kex_names[0].starts_with("curve25519") {
        assert_eq!(kex_init_msg[0], msg::KEX_ECDH_INIT);
        server.answer_curve25519(&client_kexinit, &kex_init_msg, &server_kexinit_payload)
    } else {
        assert_eq!(kex_init_msg[0], msg::KEXDH_INIT);
        server.answer_group14(&client_kexinit, &kex_init_msg, &server_kexinit_payload)
    };
    session.receive(&reply).unwrap();
    assert_eq!(session.phase(), SessionPhase::Authenticated);

    // NEWKEYS plus the auto userauth service request.
    let outbound = session.flush_outbound();
    assert_eq!(parse_plain(&outbound[0]), vec![msg::NEWKEYS]);
    let service_request = server.open_packet(&outbound[1]);
    assert_eq!(service_request[0], msg::SERVICE_REQUEST);

    // SERVICE_ACCEPT -> signed userauth request -> success.
    let mut accept = Vec::new();
    accept.push(msg::SERVICE_ACCEPT);
    accept.extend_ssh_string(b"ssh-userauth");
    let wire = server.seal_packet(&accept);
    session.receive(&wire).unwrap();

    let outbound = session.flush_outbound();
    let userauth = server.open_packet(&outbound[0]);
    assert_eq!(userauth[0], msg::USERAUTH_REQUEST);

    let wire = server.seal_packet(&[msg::USERAUTH_SUCCESS]);
    session.receive(&wire).unwrap();

    (session, server)
}

#[test]
fn identification_handshake() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    session
        .receive(&plain_packet(&server_kexinit(&[
            "curve25519-sha256@libssh.org",
        ])))
        .unwrap();

    let events = drain_events(&mut session);
    assert_eq!(
        event_names(&events),
        vec![
            "identification-sent",
            "outbound-data",
            "identification-received",
            "kex-init-sent",
            "kex-init-received",
        ]
    );
    assert_eq!(session.phase(), SessionPhase::Kex);
}

#[test]
fn banner_lines_are_discarded() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    session
        .receive(b"Welcome to the gateway\r\nanother line\n")
        .unwrap();
    assert_eq!(session.phase(), SessionPhase::Identification);
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    assert_eq!(session.phase(), SessionPhase::Negotiating);
}

#[test]
fn long_identification_line_is_fatal() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    let long = format!("SSH-2.0-{}\r\n", "x".repeat(300));
    let err = session.receive(long.as_bytes()).unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::Protocol(_)));
    assert_eq!(session.phase(), SessionPhase::Failed);

    // Nothing past identification-sent/outbound-data except the failure
    // wrap-up.
    let events = drain_events(&mut session);
    assert_eq!(
        event_names(&events),
        vec!["identification-sent", "outbound-data", "warning", "disconnect"]
    );
}

#[test]
fn split_identification_across_reads() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    session.receive(b"SSH-2.0-Open").unwrap();
    assert_eq!(session.phase(), SessionPhase::Identification);
    session.receive(b"SSH_9.6\r\n").unwrap();
    assert_eq!(session.phase(), SessionPhase::Negotiating);
}

#[test]
fn curve25519_happy_path() {
    let (mut session, _server) = establish(&["curve25519-sha256@libssh.org"]);
    let events = drain_events(&mut session);
    let names = event_names(&events);
    assert!(names.contains(&"keys-established"));
    assert!(names.contains(&"auth-success"));
    assert_eq!(session.phase(), SessionPhase::Authenticated);

    let snapshot = session.inspect();
    let algorithms = snapshot.negotiated_algorithms.unwrap();
    assert_eq!(algorithms.kex, "curve25519-sha256@libssh.org");
    assert_eq!(algorithms.cipher_c2s, "aes128-gcm@openssh.com");
    assert_eq!(algorithms.host_key, "ssh-ed25519");
}

#[test]
fn group14_fallback() {
    let (mut session, _server) = establish(&["diffie-hellman-group14-sha256"]);
    let events = drain_events(&mut session);
    assert!(event_names(&events).contains(&"keys-established"));
    assert_eq!(
        session
            .inspect()
            .negotiated_algorithms
            .unwrap()
            .kex,
        "diffie-hellman-group14-sha256"
    );
    assert_eq!(session.phase(), SessionPhase::Authenticated);
}

#[test]
fn session_channel_exec_lifecycle() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    // Open a session channel.
    session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: None,
            max_packet_size: None,
        })
        .unwrap();
    let outbound = session.flush_outbound();
    let open = server.open_packet(&outbound[0]);
    assert_eq!(open[0], msg::CHANNEL_OPEN);
    let mut r = Reader::starting_at(&open, 1);
    assert_eq!(r.read_utf8().unwrap(), "session");
    let local_id = r.read_u32().unwrap();

    let mut confirmation = Vec::new();
    confirmation.push(msg::CHANNEL_OPEN_CONFIRMATION);
    confirmation.push_u32_be(local_id);
    confirmation.push_u32_be(7); // server-side id
    confirmation.push_u32_be(2 * 1024 * 1024);
    confirmation.push_u32_be(32768);
    let wire = server.seal_packet(&confirmation);
    session.receive(&wire).unwrap();
    assert_eq!(session.phase(), SessionPhase::Connected);

    // pty-req then exec, strict FIFO replies.
    let id = mana_ssh::ChannelId(local_id);
    session
        .command(Intent::RequestChannel {
            id,
            request: ChannelRequest::Pty {
                term: "xterm-256color".into(),
                col_width: 80,
                row_height: 24,
                pix_width: 0,
                pix_height: 0,
                modes: vec![],
            },
            want_reply: true,
        })
        .unwrap();
    session
        .command(Intent::RequestChannel {
            id,
            request: ChannelRequest::Exec {
                command: "uptime".into(),
            },
            want_reply: true,
        })
        .unwrap();
    for wire in session.flush_outbound() {
        let payload = server.open_packet(&wire);
        assert_eq!(payload[0], msg::CHANNEL_REQUEST);
        let mut reply = Vec::new();
        reply.push(msg::CHANNEL_SUCCESS);
        reply.push_u32_be(local_id);
        let sealed = server.seal_packet(&reply);
        session.receive(&sealed).unwrap();
    }

    // Server output, exit status, EOF, close.
    let mut data = Vec::new();
    data.push(msg::CHANNEL_DATA);
    data.push_u32_be(local_id);
    data.extend_ssh_string(b"hello");
    let wire = server.seal_packet(&data);
    session.receive(&wire).unwrap();

    let mut exit_status = Vec::new();
    exit_status.push(msg::CHANNEL_REQUEST);
    exit_status.push_u32_be(local_id);
    exit_status.extend_ssh_string(b"exit-status");
    exit_status.push(0);
    exit_status.push_u32_be(0);
    let wire = server.seal_packet(&exit_status);
    session.receive(&wire).unwrap();

    let mut eof = Vec::new();
    eof.push(msg::CHANNEL_EOF);
    eof.push_u32_be(local_id);
    let wire = server.seal_packet(&eof);
    session.receive(&wire).unwrap();

    let mut close = Vec::new();
    close.push(msg::CHANNEL_CLOSE);
    close.push_u32_be(local_id);
    let wire = server.seal_packet(&close);
    session.receive(&wire).unwrap();

    let events = drain_events(&mut session);
    assert_eq!(
        event_names(&events),
        vec![
            "channel-open",
            "channel-request",
            "channel-request",
            "channel-data",
            "channel-exit-status",
            "channel-eof",
            "channel-close",
        ]
    );
    match &events[3] {
        SessionEvent::ChannelData { data, .. } => assert_eq!(&data[..], b"hello"),
        other => panic!("unexpected event {other:?}"),
    }
    match &events[6] {
        SessionEvent::ChannelClose { exit_status, .. } => assert_eq!(*exit_status, Some(0)),
        other => panic!("unexpected event {other:?}"),
    }

    // The engine answered the close.
    let outbound = session.flush_outbound();
    let close_reply = server.open_packet(&outbound[0]);
    assert_eq!(close_reply[0], msg::CHANNEL_CLOSE);

    let snapshot = session.inspect();
    let channel = &snapshot.channels[0];
    assert_eq!(channel.status, ChannelStatus::Closed);
    assert_eq!(channel.remote_id, Some(7));
    assert_eq!(channel.max_outbound_packet, Some(32768));
    assert_eq!(channel.exit_status, Some(0));
}

#[test]
fn channel_window_safety() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: None,
            max_packet_size: None,
        })
        .unwrap();
    let outbound = session.flush_outbound();
    server.open_packet(&outbound[0]);

    // Confirm with a tiny outbound window.
    let mut confirmation = Vec::new();
    confirmation.push(msg::CHANNEL_OPEN_CONFIRMATION);
    confirmation.push_u32_be(0);
    confirmation.push_u32_be(9);
    confirmation.push_u32_be(4); // window: 4 bytes
    confirmation.push_u32_be(32768);
    let wire = server.seal_packet(&confirmation);
    session.receive(&wire).unwrap();

    let id = mana_ssh::ChannelId(0);
    // Within the window: fine.
    session
        .command(Intent::SendChannelData {
            id,
            data: Bytes::from_static(b"hi"),
        })
        .unwrap();
    // Beyond the remaining window: rejected, window untouched.
    let err = session
        .command(Intent::SendChannelData {
            id,
            data: Bytes::from_static(b"too much data"),
        })
        .unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::Invariant(_)));

    let snapshot = session.inspect();
    assert_eq!(snapshot.channels[0].outbound_window, 2);

    // Inbound window adjustments saturate instead of wrapping.
    session
        .command(Intent::AdjustWindow { id, delta: u32::MAX })
        .unwrap();
    let snapshot = session.inspect();
    assert_eq!(snapshot.channels[0].inbound_window, u32::MAX);
}

#[test]
fn auth_failure_reports_remaining_methods() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    let mut server = TestServer::new();

    let server_kexinit_payload = server_kexinit(&["curve25519-sha256@libssh.org"]);
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    session
        .receive(&plain_packet(&server_kexinit_payload))
        .unwrap();
    let outbound = session.flush_outbound();
    let client_kexinit = parse_plain(&outbound[0]);
    let ecdh_init = parse_plain(&outbound[1]);
    let reply = server.answer_curve25519(&client_kexinit, &ecdh_init, &server_kexinit_payload);
    session.receive(&reply).unwrap();
    session.flush_outbound();

    let mut accept = Vec::new();
    accept.push(msg::SERVICE_ACCEPT);
    accept.extend_ssh_string(b"ssh-userauth");
    let wire = server.seal_packet(&accept);
    session.receive(&wire).unwrap();
    session.flush_outbound();

    let mut failure = Vec::new();
    failure.push(msg::USERAUTH_FAILURE);
    failure.extend_list(["publickey", "keyboard-interactive"].iter());
    failure.push(0);
    let wire = server.seal_packet(&failure);
    session.receive(&wire).unwrap();

    let events = drain_events(&mut session);
    let failure_event = events
        .iter()
        .find(|e| matches!(e, SessionEvent::AuthFailure { .. }))
        .expect("auth failure event");
    match failure_event {
        SessionEvent::AuthFailure { methods, partial } => {
            assert_eq!(methods, &["publickey", "keyboard-interactive"]);
            assert!(!*partial);
        }
        _ => unreachable!(),
    }

    // Channel commands stay unavailable.
    let err = session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: None,
            max_packet_size: None,
        })
        .unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::NotAuthenticated));
}

#[test]
fn keepalive_global_request_gets_a_reply() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    let mut request = Vec::new();
    request.push(msg::GLOBAL_REQUEST);
    request.extend_ssh_string(b"keepalive@openssh.com");
    request.push(1);
    let wire = server.seal_packet(&request);
    session.receive(&wire).unwrap();

    let events = drain_events(&mut session);
    assert!(matches!(
        events[0],
        SessionEvent::GlobalRequest { ref name, want_reply: true } if name == "keepalive@openssh.com"
    ));
    let outbound = session.flush_outbound();
    let reply = server.open_packet(&outbound[0]);
    assert_eq!(reply, vec![msg::REQUEST_FAILURE]);
}

#[test]
fn ext_info_records_server_sig_algs() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    let mut ext_info = Vec::new();
    ext_info.push(msg::EXT_INFO);
    ext_info.push_u32_be(1);
    ext_info.extend_ssh_string(b"server-sig-algs");
    ext_info.extend_ssh_string(b"ssh-ed25519,rsa-sha2-512");
    let wire = server.seal_packet(&ext_info);
    session.receive(&wire).unwrap();

    let snapshot = session.inspect();
    assert_eq!(
        snapshot.server_sig_algs.unwrap(),
        vec!["ssh-ed25519", "rsa-sha2-512"]
    );
}

#[test]
fn adjust_window_emits_window_adjust_packet() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: Some(1024),
            max_packet_size: None,
        })
        .unwrap();
    server.open_packet(&session.flush_outbound()[0]);

    let mut confirmation = Vec::new();
    confirmation.push(msg::CHANNEL_OPEN_CONFIRMATION);
    confirmation.push_u32_be(0);
    confirmation.push_u32_be(5);
    confirmation.push_u32_be(65536);
    confirmation.push_u32_be(32768);
    let wire = server.seal_packet(&confirmation);
    session.receive(&wire).unwrap();

    session
        .command(Intent::AdjustWindow {
            id: mana_ssh::ChannelId(0),
            delta: 4096,
        })
        .unwrap();
    let outbound = session.flush_outbound();
    let adjust = server.open_packet(&outbound[0]);
    let mut r = Reader::starting_at(&adjust, 0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_WINDOW_ADJUST);
    assert_eq!(r.read_u32().unwrap(), 5); // the server-side id
    assert_eq!(r.read_u32().unwrap(), 4096);
    assert_eq!(session.inspect().channels[0].inbound_window, 1024 + 4096);
}

#[test]
fn channel_open_failure_drops_the_channel() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: None,
            max_packet_size: None,
        })
        .unwrap();
    server.open_packet(&session.flush_outbound()[0]);

    let mut failure = Vec::new();
    failure.push(msg::CHANNEL_OPEN_FAILURE);
    failure.push_u32_be(0);
    failure.push_u32_be(4); // resource shortage
    failure.extend_ssh_string(b"no sessions left");
    failure.extend_ssh_string(b"");
    let wire = server.seal_packet(&failure);
    session.receive(&wire).unwrap();

    assert!(session.inspect().channels.is_empty());
}

#[test]
fn rekey_attempt_is_fatal() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    let kexinit = server_kexinit(&["curve25519-sha256@libssh.org"]);
    let wire = server.seal_packet(&kexinit);
    let err = session.receive(&wire).unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::Protocol(_)));
    assert_eq!(session.phase(), SessionPhase::Failed);
}

#[test]
fn exit_signal_is_surfaced() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: None,
            max_packet_size: None,
        })
        .unwrap();
    server.open_packet(&session.flush_outbound()[0]);
    let mut confirmation = Vec::new();
    confirmation.push(msg::CHANNEL_OPEN_CONFIRMATION);
    confirmation.push_u32_be(0);
    confirmation.push_u32_be(3);
    confirmation.push_u32_be(65536);
    confirmation.push_u32_be(32768);
    let wire = server.seal_packet(&confirmation);
    session.receive(&wire).unwrap();
    drain_events(&mut session);

    let mut exit_signal = Vec::new();
    exit_signal.push(msg::CHANNEL_REQUEST);
    exit_signal.push_u32_be(0);
    exit_signal.extend_ssh_string(b"exit-signal");
    exit_signal.push(0);
    exit_signal.extend_ssh_string(b"KILL");
    exit_signal.push(0);
    exit_signal.extend_ssh_string(b"killed by admin");
    exit_signal.extend_ssh_string(b"");
    let wire = server.seal_packet(&exit_signal);
    session.receive(&wire).unwrap();

    let events = drain_events(&mut session);
    match &events[0] {
        SessionEvent::ChannelExitSignal {
            signal,
            core_dumped,
            message,
            ..
        } => {
            assert_eq!(signal, "KILL");
            assert!(!core_dumped);
            assert_eq!(message, "killed by admin");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn commands_require_authentication() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    let err = session
        .command(Intent::OpenChannel {
            channel_type: "session".into(),
            initial_window_size: None,
            max_packet_size: None,
        })
        .unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::NotAuthenticated));
}

#[test]
fn oversized_packet_is_fatal() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    let mut wire = Vec::new();
    wire.push_u32_be(16 * 1024 * 1024);
    wire.extend_from_slice(&[0u8; 64]);
    let err = session.receive(&wire).unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::Protocol(_)));
    assert_eq!(session.phase(), SessionPhase::Failed);
}

#[test]
fn short_padding_is_fatal() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    // packet_length 12, padding 2 (< 4).
    let mut wire = Vec::new();
    wire.push_u32_be(12);
    wire.push(2);
    wire.extend_from_slice(&[0u8; 11]);
    let err = session.receive(&wire).unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::Protocol(_)));
}

#[test]
fn closed_session_rejects_operations() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    session.close(Some("test"));
    session.close(None); // idempotent
    assert!(matches!(
        session.receive(b"SSH-2.0-x\r\n"),
        Err(mana_ssh::SshError::Invariant(_))
    ));
    assert!(matches!(
        session.command(Intent::Disconnect { reason: None }),
        Err(mana_ssh::SshError::Invariant(_))
    ));
}

#[test]
fn server_disconnect_closes_session() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    let mut disconnect = Vec::new();
    disconnect.push(msg::DISCONNECT);
    disconnect.push_u32_be(11);
    disconnect.extend_ssh_string(b"bye");
    disconnect.extend_ssh_string(b"");
    let wire = server.seal_packet(&disconnect);
    session.receive(&wire).unwrap();

    let events = drain_events(&mut session);
    assert_eq!(event_names(&events), vec!["disconnect"]);
    match &events[0] {
        SessionEvent::Disconnect { code, description, .. } => {
            assert_eq!(*code, 11);
            assert_eq!(description, "bye");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(session.phase(), SessionPhase::Closed);
}

#[test]
fn host_key_policy_can_reject_fatally() {
    struct RejectAll;
    impl mana_ssh::hostkey::HostKeyPolicy for RejectAll {
        fn evaluate(
            &mut self,
            _candidate: &mana_ssh::hostkey::HostKeyCandidate,
        ) -> mana_ssh::hostkey::HostKeyDecision {
            mana_ssh::hostkey::HostKeyDecision::Mismatch { fatal: true }
        }
    }

    let mut config = config_with_entropy(&client_entropy_script());
    config.host_keys = Box::new(RejectAll);
    let mut session = mana_ssh::ClientSession::new(config).unwrap();
    let mut server = TestServer::new();

    let server_kexinit_payload = server_kexinit(&["curve25519-sha256@libssh.org"]);
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    session
        .receive(&plain_packet(&server_kexinit_payload))
        .unwrap();
    let outbound = session.flush_outbound();
    let client_kexinit = parse_plain(&outbound[0]);
    let ecdh_init = parse_plain(&outbound[1]);
    let reply = server.answer_curve25519(&client_kexinit, &ecdh_init, &server_kexinit_payload);

    let err = session.receive(&reply).unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::HostKeyRejected(_)));
    assert_eq!(session.phase(), SessionPhase::Failed);
}

#[test]
fn corrupted_ciphertext_is_fatal() {
    let (mut session, mut server) = establish(&["curve25519-sha256@libssh.org"]);
    drain_events(&mut session);

    let mut wire = server.seal_packet(&[msg::IGNORE]);
    let last = wire.len() - 1;
    wire[last] ^= 0xff;
    let err = session.receive(&wire).unwrap_err();
    assert!(matches!(err, mana_ssh::SshError::Decryption));
    assert_eq!(session.phase(), SessionPhase::Failed);
}

#[tokio::test]
async fn async_event_stream_mirrors_queue() {
    let mut session =
        mana_ssh::ClientSession::new(config_with_entropy(&client_entropy_script())).unwrap();
    let mut stream = session.events().expect("stream takeable once");
    assert!(session.events().is_none());

    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    session.wait_for_idle().await;

    let first = stream.next().await.unwrap();
    assert!(matches!(first, SessionEvent::IdentificationSent { .. }));
    let second = stream.next().await.unwrap();
    assert!(matches!(second, SessionEvent::OutboundData { .. }));
    let third = stream.next().await.unwrap();
    assert!(matches!(third, SessionEvent::IdentificationReceived { .. }));

    // Closing the session terminates the stream after queued events.
    session.close(None);
    while let Some(_event) = stream.next().await {}
}

#[test]
fn diagnostics_sink_sees_policy_warnings() {
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink_records = records.clone();
    let mut config = config_with_entropy(&client_entropy_script());
    config.diagnostics = Some(Arc::new(move |record| {
        sink_records.lock().unwrap().push(record);
    }));

    let mut session = mana_ssh::ClientSession::new(config).unwrap();
    let mut server = TestServer::new();
    let server_kexinit_payload = server_kexinit(&["curve25519-sha256@libssh.org"]);
    session
        .receive(format!("{SERVER_ID}\r\n").as_bytes())
        .unwrap();
    session
        .receive(&plain_packet(&server_kexinit_payload))
        .unwrap();
    let outbound = session.flush_outbound();
    let client_kexinit = parse_plain(&outbound[0]);
    let ecdh_init = parse_plain(&outbound[1]);
    let reply = server.answer_curve25519(&client_kexinit, &ecdh_init, &server_kexinit_payload);
    session.receive(&reply).unwrap();

    // Extended data is discarded with a warning diagnostic, not an event.
    session.flush_outbound();
    let mut ext = Vec::new();
    ext.push(msg::CHANNEL_EXTENDED_DATA);
    ext.push_u32_be(0);
    ext.push_u32_be(1);
    ext.extend_ssh_string(b"stderr noise");
    let wire = server.seal_packet(&ext);
    session.receive(&wire).unwrap();

    let codes: Vec<String> = records
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.code.clone())
        .collect();
    assert!(codes.contains(&"extended-data".to_owned()));
}
