//! Staging state machine (C6): the STAGE0/STAGE1/STAGE2 handshake.
//!
//! The server is stateless between messages; everything that survives
//! across the three steps lives on the agent row or in the staging key
//! itself. Callers are expected to have already AE-unwrapped the routing
//! packet under the staging (STAGE0/STAGE1) or session (STAGE2) key —
//! this module only ever sees plaintext.

use rand::RngCore;
use tracing::{info, warn};

use crate::collab::{AutorunProvider, Broadcaster};
use crate::config::ListenerOptions;
use crate::crypto::{aes_encrypt_then_hmac, dh, dh_derive, dh_generate, rsa_encrypt, rsa_xml_to_key, random_nonce};
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventSink};
use crate::packet::Language;
use crate::store::{Agent, AgentStore};

const SESSION_ID_LEN: usize = 8;
const NONCE_LEN: usize = 16;
const MIN_RSA_XML_LEN: usize = 400;

fn generate_session_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = [0u8; SESSION_ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char).collect()
}

/// `STAGE0` only signals "ok, send stage1" — the listener owns translating
/// it into a prebuilt stager blob.
pub fn handle_stage0() -> Vec<u8> {
    b"STAGE0".to_vec()
}

/// `STAGE1`: mint a session, reply with the handshake's second leg.
pub fn handle_stage1(
    store: &AgentStore,
    language: Language,
    staging_key: &[u8],
    plaintext: &[u8],
    listener_options: &ListenerOptions,
    events: &dyn EventSink,
) -> Result<(String, Vec<u8>)> {
    let nonce = random_nonce(NONCE_LEN);
    let session_id = generate_session_id();

    let (session_key, reply): (Vec<u8>, Vec<u8>) = match language {
        Language::Powershell => {
            let stripped: String = String::from_utf8_lossy(plaintext)
                .chars()
                .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
                .collect();
            if stripped.len() < MIN_RSA_XML_LEN {
                warn!(session_id, "STAGE1 RSA XML shorter than minimum");
                return Err(AgentError::InvalidKeyFormat);
            }
            let agent_pub = rsa_xml_to_key(&stripped)?;

            let mut session_key = vec![0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut session_key);

            let mut msg = nonce.clone().into_bytes();
            msg.extend_from_slice(&session_key);
            let reply = rsa_encrypt(&agent_pub, &msg)?;
            (session_key, reply)
        }
        Language::Python => {
            let decimal = String::from_utf8_lossy(plaintext).trim().to_string();
            if !dh::DH_PUBLIC_DECIMAL_LEN.contains(&decimal.len()) || !decimal.bytes().all(|b| b.is_ascii_digit()) {
                warn!(session_id, len = decimal.len(), "STAGE1 DH public outside accepted length window");
                return Err(AgentError::InvalidKeyFormat);
            }
            let server = dh_generate();
            let session_key = dh_derive(&server.private, &decimal)?.to_vec();

            let mut msg = nonce.clone().into_bytes();
            msg.extend_from_slice(server.public.to_str_radix(10).as_bytes());
            let reply = aes_encrypt_then_hmac(staging_key, &msg);
            (session_key, reply)
        }
    };

    let agent = Agent::new_staged(
        session_id.clone(),
        language,
        session_key,
        staging_key.to_vec(),
        nonce,
        listener_options.name.clone(),
        listener_options.default_delay,
        listener_options.default_jitter,
        listener_options.default_lost_limit,
        listener_options.default_profile.clone(),
        listener_options.kill_date.clone(),
        listener_options.working_hours.clone(),
    );
    store.add_agent(agent)?;
    info!(session_id, language = language.as_str(), "agent staged at STAGE1");
    events.publish(AgentEvent::checkin(&session_id, "staged"));

    Ok((session_id, reply))
}

/// `STAGE2`: sysinfo ingestion and activation. Protocol-level failures
/// (bad field count, nonce mismatch) are reported as an `ERROR`-prefixed
/// reply rather than a Rust error — the agent row is rolled back either
/// way.
#[allow(clippy::too_many_arguments)]
pub fn handle_stage2(
    store: &AgentStore,
    events: &dyn EventSink,
    broadcaster: &dyn Broadcaster,
    autorun_provider: &dyn AutorunProvider,
    listener_options: &ListenerOptions,
    session_id: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(plaintext);
    let fields: Vec<&str> = text.split('|').collect();

    if fields.len() != 12 {
        warn!(session_id, count = fields.len(), "STAGE2 malformed sysinfo");
        store.remove_agent(session_id)?;
        return Ok(b"ERROR: malformed sysinfo".to_vec());
    }

    let stored_nonce: u64 = store
        .get_agent(session_id)
        .and_then(|a| a.nonce.parse().ok())
        .unwrap_or(0);
    let presented: u64 = fields[0].parse().unwrap_or(0);

    if presented != stored_nonce + 1 {
        warn!(session_id, "STAGE2 nonce replay detected");
        store.remove_agent(session_id)?;
        return Ok(b"ERROR: nonce replay".to_vec());
    }

    let listener = fields[1];
    let domain = fields[2];
    let user = fields[3];
    let host = fields[4];
    let internal_ip = fields[5];
    let os_details = fields[6];
    let high_integrity = fields[7];
    let proc_name = fields[8];
    let proc_id: u32 = fields[9].parse().unwrap_or(0);
    let language = fields[10];
    let language_version = fields[11];

    let username = if domain.is_empty() {
        user.to_string()
    } else {
        format!("{domain}\\{user}")
    };

    store.update_sysinfo(session_id, |agent| {
        agent.listener = listener.to_string();
        agent.username = username;
        agent.hostname = host.to_string();
        agent.internal_ip = internal_ip.to_string();
        agent.os_details = os_details.to_string();
        agent.high_integrity = high_integrity == "True";
        agent.process_name = proc_name.to_string();
        agent.process_id = proc_id;
        agent.language_version = language_version.to_string();
        if let Some(parsed) = Language::parse_str(language) {
            agent.language = parsed;
        }
    })?;

    info!(session_id, "agent activated at STAGE2");
    events.publish(AgentEvent::checkin(session_id, "agent.activated"));

    if !listener_options.slack_url.is_empty() {
        broadcaster.broadcast(
            "webhook",
            &format!("agent {session_id} ({host}\\{user}) checked in"),
        );
    }

    run_autorun(store, events, autorun_provider, session_id)?;

    Ok(format!("STAGE2: {session_id}").into_bytes())
}

fn run_autorun(
    store: &AgentStore,
    events: &dyn EventSink,
    autorun_provider: &dyn AutorunProvider,
    session_id: &str,
) -> Result<()> {
    let global = store.db.get_global_config()?;
    if !global.autorun_command.is_empty() && !global.autorun_data.is_empty() {
        let body = format!("{} {}", global.autorun_command, global.autorun_data).into_bytes();
        let task_name = crate::dispatch::Opcode::TaskShell.to_u16();
        if let Err(e) = store.enqueue(session_id, task_name, body, 0, Some("autorun".to_string())) {
            warn!(session_id, error = %e, "global autorun enqueue failed");
        }
    }

    let Some(agent) = store.get_agent(session_id) else {
        return Ok(());
    };
    for (task_name, body) in autorun_provider.commands_for(agent.language) {
        if let Err(e) = store.enqueue(session_id, task_name, body, 0, Some("autorun".to_string())) {
            warn!(session_id, error = %e, "per-language autorun enqueue failed");
        }
    }
    let _ = events;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{NullAutorunProvider, NullBroadcaster};
    use crate::crypto::aes_decrypt_and_verify;
    use crate::events::EventBus;
    use crate::persistence::SqliteStore;
    use std::sync::Arc;

    fn fresh_store() -> AgentStore {
        AgentStore::open(Arc::new(SqliteStore::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn stage0_replies_with_literal_marker() {
        assert_eq!(handle_stage0(), b"STAGE0");
    }

    #[test]
    fn stage1_powershell_happy_path() {
        use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

        let priv_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let pub_key = priv_key.to_public_key();
        use rsa::traits::PublicKeyParts;
        let n_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, pub_key.n().to_bytes_be());
        let e_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, pub_key.e().to_bytes_be());
        let xml = format!("<RSAKeyValue><Modulus>{n_b64}</Modulus><Exponent>{e_b64}</Exponent></RSAKeyValue>");

        let store = fresh_store();
        let events = EventBus::new();
        let opts = ListenerOptions::default();
        let (session_id, reply) =
            handle_stage1(&store, Language::Powershell, b"staging-key", xml.as_bytes(), &opts, &events).unwrap();

        assert!(store.contains(&session_id));
        let plaintext = priv_key.decrypt(Pkcs1v15Encrypt, &reply).unwrap();
        assert_eq!(plaintext.len(), 16 + 32);
    }

    #[test]
    fn stage1_python_happy_path() {
        let client = dh_generate();
        let decimal = client.public.to_str_radix(10);
        let staging_key = b"shared-staging-key";

        let store = fresh_store();
        let events = EventBus::new();
        let opts = ListenerOptions::default();
        let (session_id, reply) =
            handle_stage1(&store, Language::Python, staging_key, decimal.as_bytes(), &opts, &events).unwrap();

        let opened = aes_decrypt_and_verify(staging_key, &reply).unwrap();
        let server_pub_str = std::str::from_utf8(&opened[16..]).unwrap();
        let client_secret = dh_derive(&client.private, server_pub_str).unwrap();

        let agent = store.get_agent(&session_id).unwrap();
        assert_eq!(agent.session_key, client_secret);
    }

    #[test]
    fn stage1_rejects_undersized_rsa_xml() {
        let store = fresh_store();
        let events = EventBus::new();
        let opts = ListenerOptions::default();
        assert!(handle_stage1(&store, Language::Powershell, b"staging-key", b"<RSAKeyValue/>", &opts, &events).is_err());
    }

    #[test]
    fn stage2_activates_on_correct_nonce() {
        let store = fresh_store();
        let events = EventBus::new();
        let broadcaster = NullBroadcaster;
        let autorun = NullAutorunProvider;
        let opts = ListenerOptions::default();

        let (session_id, _) =
            handle_stage1(&store, Language::Powershell, b"staging-key", &sample_xml(), &opts, &events).unwrap();
        let nonce: u64 = store.get_agent(&session_id).unwrap().nonce.parse().unwrap();

        let body = format!("{}|http|WORKGROUP|alice|BOX01|10.0.0.5|Windows 10|True|powershell|4242|powershell|5.1", nonce + 1);
        let reply = handle_stage2(&store, &events, &broadcaster, &autorun, &opts, &session_id, body.as_bytes()).unwrap();

        assert_eq!(reply, format!("STAGE2: {session_id}").into_bytes());
        let agent = store.get_agent(&session_id).unwrap();
        assert_eq!(agent.username, "WORKGROUP\\alice");
        assert!(agent.high_integrity);
        assert_eq!(agent.process_id, 4242);
    }

    #[test]
    fn stage2_removes_agent_on_nonce_replay() {
        let store = fresh_store();
        let events = EventBus::new();
        let broadcaster = NullBroadcaster;
        let autorun = NullAutorunProvider;
        let opts = ListenerOptions::default();

        let (session_id, _) =
            handle_stage1(&store, Language::Powershell, b"staging-key", &sample_xml(), &opts, &events).unwrap();
        let nonce: u64 = store.get_agent(&session_id).unwrap().nonce.parse().unwrap();

        let body = format!("{nonce}|http|WORKGROUP|alice|BOX01|10.0.0.5|Windows 10|True|powershell|1|powershell|5.1");
        let reply = handle_stage2(&store, &events, &broadcaster, &autorun, &opts, &session_id, body.as_bytes()).unwrap();

        assert!(reply.starts_with(b"ERROR"));
        assert!(!store.contains(&session_id));
    }

    #[test]
    fn stage2_removes_agent_on_malformed_field_count() {
        let store = fresh_store();
        let events = EventBus::new();
        let broadcaster = NullBroadcaster;
        let autorun = NullAutorunProvider;
        let opts = ListenerOptions::default();

        let (session_id, _) =
            handle_stage1(&store, Language::Powershell, b"staging-key", &sample_xml(), &opts, &events).unwrap();
        let reply = handle_stage2(&store, &events, &broadcaster, &autorun, &opts, &session_id, b"too|few|fields").unwrap();

        assert!(reply.starts_with(b"ERROR"));
        assert!(!store.contains(&session_id));
    }

    fn sample_xml() -> Vec<u8> {
        use rsa::RsaPrivateKey;
        use rsa::traits::PublicKeyParts;
        let priv_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let pub_key = priv_key.to_public_key();
        let n_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, pub_key.n().to_bytes_be());
        let e_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, pub_key.e().to_bytes_be());
        format!("<RSAKeyValue><Modulus>{n_b64}</Modulus><Exponent>{e_b64}</Exponent></RSAKeyValue>").into_bytes()
    }
}
