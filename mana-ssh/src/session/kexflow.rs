//! Key exchange driving: KEXINIT handling, the DH/ECDH reply, key
//! derivation and NEWKEYS activation.

use mana_common::DiagnosticRecord;
use num_bigint::BigUint;

use super::events::SessionEvent;
use super::{AuthProgress, ClientSession, SessionPhase};
use crate::cipher::{DirectionState, GcmDirection};
use crate::codec::Reader;
use crate::crypto::kdf::derive_key_material;
use crate::crypto::{AES128_KEY_LEN, GCM_NONCE_LEN};
use crate::hostkey::{format_fingerprint, HostKeyCandidate, HostKeyDecision};
use crate::kex::{self, HashField, KexState};
use crate::{msg, negotiation, SshError};

/// Derived key material for one direction, held until its NEWKEYS
/// activation.
pub(crate) struct PendingKeys {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl ClientSession {
    pub(super) fn on_kexinit(&mut self, payload: &[u8]) -> Result<(), SshError> {
        if self.negotiated.is_some() {
            // Rekeying is outside this engine's scope; long-lived
            // sessions fail loudly instead of running on stale keys.
            return Err(SshError::Protocol(
                "peer initiated key re-exchange, which is unsupported".into(),
            ));
        }
        self.server_kexinit = Some(payload.to_vec());
        self.send_client_kexinit()?;

        let server = negotiation::parse_kexinit(payload)?;
        let names = match negotiation::negotiate(&self.config.algorithms, &server) {
            Ok(names) => names,
            Err(err) => {
                self.diagnostic(
                    DiagnosticRecord::error("algorithm-mismatch", err.to_string())
                        .with_detail(format!("server kex: {:?}", server.kex)),
                );
                return Err(err);
            }
        };
        debug!(kex = %names.kex, host_key = %names.host_key, cipher = %names.cipher_c2s, "negotiated");
        self.events.push(SessionEvent::KexInitReceived);
        self.phase = SessionPhase::Kex;

        if server.first_kex_packet_follows
            && !negotiation::guess_matches(&self.config.algorithms, &server)
        {
            self.ignore_next_kex_packet = true;
            self.diagnostic(DiagnosticRecord::info(
                "guessed-kex-pending",
                "server guessed its first kex packet with other algorithms",
            ));
        }

        let provider = self.config.crypto.clone();
        let (state, init_payload) =
            KexState::initiate(&names.kex, provider.as_ref(), self.config.entropy.as_mut())
                .map_err(|err| SshError::Protocol(format!("cannot start kex: {err}")))?;
        self.send_packet(&init_payload)?;
        self.kex_state = Some(state);
        self.negotiated = Some(names);
        Ok(())
    }

    pub(super) fn on_kex_reply(&mut self, payload: &[u8]) -> Result<(), SshError> {
        let kex_state = self
            .kex_state
            .take()
            .ok_or_else(|| SshError::Protocol("kex reply without kex in flight".into()))?;
        let names = self
            .negotiated
            .clone()
            .ok_or(SshError::Invariant("kex reply before negotiation"))?;
        let provider = self.config.crypto.clone();

        let mut r = Reader::starting_at(payload, 1);
        let host_key_blob = r.read_string()?;

        // Host key blob: (algorithm, raw key).
        let mut blob_r = Reader::new(host_key_blob);
        let host_key_algorithm = blob_r.read_utf8()?.to_owned();
        if host_key_algorithm != names.host_key {
            return Err(SshError::Protocol(format!(
                "host key algorithm {host_key_algorithm:?} does not match negotiated {:?}",
                names.host_key
            )));
        }
        let raw_host_key: Vec<u8> = if host_key_algorithm == "ssh-ed25519" {
            blob_r.read_string()?.to_vec()
        } else {
            blob_r.read_remaining().to_vec()
        };

        // Server public value and signature.
        enum ServerPublic {
            Curve(Vec<u8>),
            Group14(BigUint),
        }
        let server_public = match &kex_state {
            KexState::Curve25519 { .. } => ServerPublic::Curve(r.read_string()?.to_vec()),
            KexState::Group14 { .. } => {
                ServerPublic::Group14(BigUint::from_bytes_be(r.read_mpint()?))
            }
        };
        let signature_blob = r.read_string()?;
        let mut sig_r = Reader::new(signature_blob);
        let signature_algorithm = sig_r.read_utf8()?;
        let signature_acceptable = signature_algorithm == names.host_key
            || (self.config.guards.allow_sha1_signatures
                && signature_algorithm == "ssh-rsa"
                && names.host_key.starts_with("rsa-"));
        if !signature_acceptable {
            return Err(SshError::Protocol(format!(
                "signature algorithm {signature_algorithm:?} does not match negotiated {:?}",
                names.host_key
            )));
        }
        let raw_signature = sig_r.read_string()?;

        // Shared secret and the exchange hash fields.
        let (shared_magnitude, client_field, server_field);
        let (client_pub_bytes, server_pub_bytes);
        match (&kex_state, &server_public) {
            (KexState::Curve25519 { scalar, public }, ServerPublic::Curve(peer)) => {
                let peer: &[u8; 32] = peer
                    .as_slice()
                    .try_into()
                    .map_err(|_| SshError::Protocol("curve25519 peer key is not 32 bytes".into()))?;
                let shared = provider.x25519(scalar, peer)?;
                if shared == [0u8; 32] {
                    return Err(SshError::Protocol("low-order curve25519 peer point".into()));
                }
                shared_magnitude = kex::curve25519_shared_magnitude(&shared);
                client_pub_bytes = public.to_vec();
                server_pub_bytes = peer.to_vec();
                client_field = HashField::Str(&client_pub_bytes);
                server_field = HashField::Str(&server_pub_bytes);
            }
            (KexState::Group14 { exponent, public }, ServerPublic::Group14(peer)) => {
                let shared = kex::group14::shared_secret(peer, exponent)?;
                shared_magnitude = shared.to_bytes_be();
                client_pub_bytes = public.to_bytes_be();
                server_pub_bytes = peer.to_bytes_be();
                client_field = HashField::Mpint(&client_pub_bytes);
                server_field = HashField::Mpint(&server_pub_bytes);
            }
            _ => return Err(SshError::Invariant("kex state and reply kind diverged")),
        }

        let server_id = self
            .server_id_line()
            .ok_or(SshError::Invariant("kex before identification"))?
            .to_owned();
        let client_kexinit = self
            .client_kexinit
            .clone()
            .ok_or(SshError::Invariant("kex reply before client KEXINIT"))?;
        let server_kexinit = self
            .server_kexinit
            .clone()
            .ok_or(SshError::Invariant("kex reply before server KEXINIT"))?;

        let exchange_hash = kex::exchange_hash(
            provider.as_ref(),
            self.client_id_line(),
            &server_id,
            &client_kexinit,
            &server_kexinit,
            host_key_blob,
            client_field,
            server_field,
            &shared_magnitude,
        );

        // The first exchange hash becomes the session id, permanently.
        let session_id = *self.session_id.get_or_insert(exchange_hash);

        self.check_host_key(&names.host_key, &raw_host_key)?;

        // Only Ed25519 host keys verify in this engine; anything else the
        // server may legitimately pick from our list is a hard stop.
        if names.host_key != "ssh-ed25519" {
            return Err(SshError::Protocol(format!(
                "cannot verify {} host key signatures",
                names.host_key
            )));
        }
        let raw_host_key: &[u8; 32] = raw_host_key
            .as_slice()
            .try_into()
            .map_err(|_| SshError::Protocol("ed25519 host key is not 32 bytes".into()))?;
        let raw_signature: &[u8; 64] = raw_signature
            .try_into()
            .map_err(|_| SshError::Protocol("ed25519 signature is not 64 bytes".into()))?;
        if !provider.ed25519_verify(raw_host_key, raw_signature, &exchange_hash) {
            return Err(SshError::WrongServerSignature);
        }

        // RFC 4253 §7.2 with SHA-256: IVs from 'A'/'B', keys from 'C'/'D'.
        let shared_field = kex::shared_mpint_field(&shared_magnitude);
        let derive = |letter: u8, len: usize| {
            derive_key_material(
                provider.as_ref(),
                &shared_field,
                &exchange_hash,
                letter,
                &session_id,
                len,
            )
        };
        let iv_c2s = derive(b'A', GCM_NONCE_LEN);
        let iv_s2c = derive(b'B', GCM_NONCE_LEN);
        let key_c2s = derive(b'C', AES128_KEY_LEN);
        let key_s2c = derive(b'D', AES128_KEY_LEN);
        self.pending_seal = Some(PendingKeys {
            key: key_c2s,
            iv: iv_c2s,
        });
        self.pending_open = Some(PendingKeys {
            key: key_s2c,
            iv: iv_s2c,
        });

        self.events.push(SessionEvent::KeysEstablished {
            algorithms: names,
        });
        self.send_packet(&[msg::NEWKEYS])?;

        // Our direction switches over immediately after our NEWKEYS.
        let pending = self
            .pending_seal
            .take()
            .ok_or(SshError::Invariant("pending seal keys vanished"))?;
        self.seal = DirectionState::Aes128Gcm(GcmDirection::from_key_material(
            &pending.key,
            &pending.iv,
            self.seal.sequence(),
        )?);
        self.awaiting_server_newkeys = true;
        debug!("client-to-server cipher active");
        Ok(())
    }

    fn check_host_key(&mut self, key_type: &str, raw: &[u8]) -> Result<(), SshError> {
        let provider = self.config.crypto.clone();
        let identity = self.config.host_identity.clone();
        let (host, port) = identity
            .map(|h| (h.host, h.port))
            .unwrap_or_else(|| (String::new(), 22));
        let candidate = HostKeyCandidate {
            host,
            port,
            key_type: key_type.to_owned(),
            fingerprint: format_fingerprint(&provider.sha256(raw)),
            raw: raw.to_vec(),
        };
        let decision = self.config.host_keys.evaluate(&candidate);
        match decision {
            HostKeyDecision::Trusted => {
                self.config.host_keys.remember(&candidate, &decision);
                Ok(())
            }
            HostKeyDecision::Mismatch { fatal: false } => {
                self.diagnostic(
                    DiagnosticRecord::warning(
                        "host-key-mismatch",
                        format!("host key mismatch for {}:{}", candidate.host, candidate.port),
                    )
                    .with_detail(candidate.fingerprint.clone()),
                );
                Ok(())
            }
            HostKeyDecision::Mismatch { fatal: true } => Err(SshError::HostKeyRejected(format!(
                "{}:{} {}",
                candidate.host, candidate.port, candidate.fingerprint
            ))),
        }
    }

    pub(super) fn on_newkeys(&mut self) -> Result<(), SshError> {
        if !self.awaiting_server_newkeys {
            return Err(SshError::Protocol("unexpected NEWKEYS".into()));
        }
        let pending = self
            .pending_open
            .take()
            .ok_or(SshError::Invariant("pending open keys vanished"))?;
        self.open = DirectionState::Aes128Gcm(GcmDirection::from_key_material(
            &pending.key,
            &pending.iv,
            self.open.sequence(),
        )?);
        self.awaiting_server_newkeys = false;
        debug!("server-to-client cipher active");

        if !matches!(self.phase, SessionPhase::Failed | SessionPhase::Closed) {
            self.phase = SessionPhase::Authenticated;
        }

        if !self.config.guards.disable_auto_userauth && self.config.identity.is_some() {
            self.send_packet(&crate::auth::service_request_payload())?;
            self.auth = AuthProgress::ServiceRequested;
        }
        Ok(())
    }
}
