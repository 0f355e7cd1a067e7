//! Agent session manager: staging handshake, routing-packet multiplexing,
//! per-agent task/result queues, and the response dispatcher (C7 ties C1,
//! C2, C6, and C8 together behind one synchronous call per transport body).

pub mod autorun;
pub mod collab;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod filesink;
pub mod packet;
pub mod persistence;
pub mod queue;
pub mod staging;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::collab::{
    AutorunProvider, Broadcaster, CredentialStore, NullAutorunProvider, NullBroadcaster,
    NullCredentialStore,
};
use crate::config::ListenerOptions;
use crate::crypto::{aes_decrypt_and_verify, aes_encrypt_then_hmac};
use crate::dispatch::{dispatch, DispatchContext};
use crate::error::Result;
use crate::events::{EventBus, EventSink};
use crate::packet::{
    decode_result_packet, decode_routing_packet, encode_routing_packet, encode_task_packet,
    Language, MetaTag, RoutingFrame, TaskRecord,
};
use crate::persistence::Store;
use crate::store::AgentStore;

/// Process-wide context — database handle, event bus, collaborators, and
/// the download root — threaded explicitly through every call rather than
/// reached for via a singleton.
pub struct Core {
    pub store: AgentStore,
    pub events: Arc<dyn EventSink>,
    pub credentials: Arc<dyn CredentialStore>,
    pub autorun_provider: Arc<dyn AutorunProvider>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub downloads_root: PathBuf,
}

impl Core {
    pub fn new(db: Arc<dyn Store>, downloads_root: PathBuf) -> Result<Self> {
        Ok(Self {
            store: AgentStore::open(db)?,
            events: Arc::new(EventBus::new()),
            credentials: Arc::new(NullCredentialStore),
            autorun_provider: Arc::new(NullAutorunProvider),
            broadcaster: Arc::new(NullBroadcaster),
            downloads_root,
        })
    }

    pub fn with_collaborators(
        mut self,
        events: Arc<dyn EventSink>,
        credentials: Arc<dyn CredentialStore>,
        autorun_provider: Arc<dyn AutorunProvider>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        self.events = events;
        self.credentials = credentials;
        self.autorun_provider = autorun_provider;
        self.broadcaster = broadcaster;
        self
    }

    /// One inbound transport body, possibly multiplexing several agents.
    ///
    /// The whole body is AE-sealed under `staging_key` (the only key known
    /// before any per-agent session exists); once opened it decodes to a
    /// concatenation of routing frames. STAGE0/STAGE1 payloads are then
    /// plaintext; STAGE2, TASKING_REQUEST, and RESULT_POST payloads carry a
    /// second AE layer sealed under that agent's own session key.
    pub fn handle_agent_data(
        &self,
        staging_key: &[u8],
        routing_packet_bytes: &[u8],
        listener_options: &ListenerOptions,
        client_ip: &str,
        update_lastseen: bool,
    ) -> Vec<(Language, Vec<u8>)> {
        let plaintext = match aes_decrypt_and_verify(staging_key, routing_packet_bytes) {
            Ok(p) => p,
            Err(_) => {
                warn!("routing packet failed to authenticate under staging key");
                return Vec::new();
            }
        };

        let frames = match decode_routing_packet(&plaintext) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed routing packet body");
                return Vec::new();
            }
        };

        let mut replies = Vec::new();
        for frame in &frames {
            if let Some(reply) =
                self.handle_frame(staging_key, frame, listener_options, client_ip, update_lastseen)
            {
                replies.push((frame.language, reply));
            }
        }
        replies
    }

    fn handle_frame(
        &self,
        staging_key: &[u8],
        frame: &RoutingFrame,
        listener_options: &ListenerOptions,
        client_ip: &str,
        update_lastseen: bool,
    ) -> Option<Vec<u8>> {
        match frame.meta {
            MetaTag::Stage0 => Some(staging::handle_stage0()),
            MetaTag::Stage1 => self.handle_stage1_frame(staging_key, frame, listener_options, client_ip),
            MetaTag::Stage2 => self.handle_stage2_frame(frame, listener_options),
            MetaTag::TaskingRequest => self.handle_tasking_request(frame, update_lastseen),
            MetaTag::ResultPost => {
                self.handle_result_post(frame);
                None
            }
            MetaTag::ServerResponse => {
                warn!(session_id = %frame.session_id, "agent-originated frame tagged SERVER_RESPONSE, dropping");
                None
            }
        }
    }

    fn handle_stage1_frame(
        &self,
        staging_key: &[u8],
        frame: &RoutingFrame,
        listener_options: &ListenerOptions,
        client_ip: &str,
    ) -> Option<Vec<u8>> {
        match staging::handle_stage1(
            &self.store,
            frame.language,
            staging_key,
            &frame.payload,
            listener_options,
            self.events.as_ref(),
        ) {
            Ok((session_id, reply)) => {
                let _ = self.store.update_sysinfo(&session_id, |agent| {
                    agent.external_ip = client_ip.to_string();
                });
                Some(reply)
            }
            Err(e) => {
                warn!(error = %e, "STAGE1 failed");
                None
            }
        }
    }

    fn handle_stage2_frame(&self, frame: &RoutingFrame, listener_options: &ListenerOptions) -> Option<Vec<u8>> {
        let agent = self.store.get_agent(&frame.session_id)?;
        let plaintext = match aes_decrypt_and_verify(&agent.session_key, &frame.payload) {
            Ok(p) => p,
            Err(_) => {
                warn!(session_id = %frame.session_id, "STAGE2 payload failed to authenticate");
                return None;
            }
        };

        match staging::handle_stage2(
            &self.store,
            self.events.as_ref(),
            self.broadcaster.as_ref(),
            self.autorun_provider.as_ref(),
            listener_options,
            &frame.session_id,
            &plaintext,
        ) {
            Ok(reply) => Some(aes_encrypt_then_hmac(&agent.session_key, &reply)),
            Err(e) => {
                warn!(session_id = %frame.session_id, error = %e, "STAGE2 failed");
                None
            }
        }
    }

    fn handle_tasking_request(&self, frame: &RoutingFrame, update_lastseen: bool) -> Option<Vec<u8>> {
        let agent = match self.store.get_agent(&frame.session_id) {
            Some(a) => a,
            None => {
                warn!(session_id = %frame.session_id, "TASKING_REQUEST from unknown agent, dropping");
                return None;
            }
        };

        if update_lastseen {
            let _ = self.store.update_lastseen(&frame.session_id);
        }

        let tasks = self.store.drain(&frame.session_id).unwrap_or_default();
        let records: Vec<TaskRecord> = tasks
            .into_iter()
            .map(|t| TaskRecord { task_name: t.name, task_id: t.task_id, body: t.body })
            .collect();
        let body = encode_task_packet(&records);
        let sealed = aes_encrypt_then_hmac(&agent.session_key, &body);

        let reply_frame = RoutingFrame {
            session_id: frame.session_id.clone(),
            language: agent.language,
            meta: MetaTag::ServerResponse,
            additional: 0,
            payload: sealed,
        };
        Some(encode_routing_packet(&[reply_frame]))
    }

    fn handle_result_post(&self, frame: &RoutingFrame) {
        let agent = match self.store.get_agent(&frame.session_id) {
            Some(a) => a,
            None => {
                warn!(session_id = %frame.session_id, "RESULT_POST from unknown agent, dropping");
                return;
            }
        };

        let plaintext = match aes_decrypt_and_verify(&agent.session_key, &frame.payload) {
            Ok(p) => p,
            Err(_) => {
                warn!(session_id = %frame.session_id, "RESULT_POST payload failed to authenticate");
                return;
            }
        };

        let chunks = match decode_result_packet(&plaintext) {
            Ok(c) => c,
            Err(e) => {
                warn!(session_id = %frame.session_id, error = %e, "RESULT_POST body malformed, discarding batch");
                return;
            }
        };

        let ctx = DispatchContext {
            store: &self.store,
            events: self.events.as_ref(),
            credentials: self.credentials.as_ref(),
            downloads_root: &self.downloads_root,
        };
        for chunk in &chunks {
            if let Err(e) = dispatch(&ctx, &frame.session_id, chunk) {
                warn!(session_id = %frame.session_id, error = %e, "dispatch failed for chunk");
            }
        }
        info!(session_id = %frame.session_id, count = chunks.len(), "applied result batch");
    }
}
