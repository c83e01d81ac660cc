use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};
use oflb_common::ofp::{
    version_bitmap, ErrorMsg, FlowMod, GroupMod, Message, MultipartBody, SwitchDesc,
    SwitchFeatures, OFPET_HELLO_FAILED, OFPHFC_INCOMPATIBLE, OFPMP_DESC, OFPMP_GROUP_FEATURES,
    OFP_VERSION,
};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

use crate::channel::Channel;
use crate::compiler::DesiredState;
use crate::config::ControllerSettings;
use crate::error::{ChannelError, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Handshaking,
    /// Clearing the switch and installing the desired state.
    Syncing,
    Synced,
    /// The last installation attempt was rejected; a full retry is pending.
    SyncFailed,
}

/// What the controller knows about the switch. `installed` is only set while
/// the switch's tables are known to equal it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwitchSession {
    pub state: ConnectionState,
    pub datapath_id: Option<u64>,
    pub switch: Option<String>,
    pub installed: Option<DesiredState>,
    pub last_error: Option<String>,
    pub completed_syncs: u64,
}

/// Shared read side of the session, written only by [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<SwitchSession>>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SwitchSession {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    fn update(&self, f: impl FnOnce(&mut SwitchSession)) {
        let mut session = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut session);
    }

    fn transition(&self, to: ConnectionState) {
        self.update(|s| {
            if s.state != to {
                debug!("session {:?} -> {:?}", s.state, to);
            }
            if to != ConnectionState::Synced {
                s.installed = None;
            }
            s.state = to;
        });
    }

    fn fail(&self, to: ConnectionState, err: &SessionError) {
        self.transition(to);
        self.update(|s| s.last_error = Some(err.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    Complete,
    Preempted,
}

/// Drives one switch connection at a time through handshake, resync and
/// steady state.
pub struct Session {
    settings: ControllerSettings,
    handle: SessionHandle,
    desired: watch::Receiver<Arc<DesiredState>>,
}

impl Session {
    pub fn new(
        settings: ControllerSettings,
        handle: SessionHandle,
        desired: watch::Receiver<Arc<DesiredState>>,
    ) -> Self {
        Session {
            settings,
            handle,
            desired,
        }
    }

    /// Runs a connection until it fails. With `until_synced` the session
    /// returns as soon as the switch holds the desired state, leaving the
    /// installed rules in place.
    pub async fn run<S>(&mut self, stream: S, until_synced: bool) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.drive(stream, until_synced).await;
        if let Err(err) = &result {
            self.handle.fail(ConnectionState::Disconnected, err);
        }
        result
    }

    async fn drive<S>(&mut self, stream: S, until_synced: bool) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handle.transition(ConnectionState::Handshaking);
        let mut channel = Channel::new(stream, self.settings.timeout());

        let (features, desc) = handshake(&mut channel).await?;
        info!(
            "switch {:016x} connected: {} tables",
            features.datapath_id, features.n_tables
        );
        self.handle.update(|s| {
            s.datapath_id = Some(features.datapath_id);
            s.switch = desc.map(|d| format!("{} {} {}", d.mfr_desc, d.hw_desc, d.sw_desc));
        });

        self.sync(&mut channel).await?;
        if until_synced {
            return Ok(());
        }
        self.steady(&mut channel).await
    }

    fn preempted(&self) -> bool {
        self.desired.has_changed().unwrap_or(false)
    }

    async fn sync<S>(&mut self, channel: &mut Channel<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut failures = 0;
        loop {
            let desired = self.desired.borrow_and_update().clone();
            self.handle.transition(ConnectionState::Syncing);
            match self.install(channel, &desired).await {
                Ok(Install::Complete) => {
                    info!(
                        "switch synced: group {} with {} buckets, {} flows",
                        desired.group.id,
                        desired.group.buckets.len(),
                        desired.flows.len()
                    );
                    self.handle.update(|s| {
                        s.state = ConnectionState::Synced;
                        s.installed = Some(DesiredState::clone(&desired));
                        s.last_error = None;
                        s.completed_syncs += 1;
                    });
                    return Ok(());
                }
                Ok(Install::Preempted) => {
                    info!("desired state changed during sync, starting over");
                }
                Err(err) if err.is_installation() => {
                    failures += 1;
                    error!(
                        "sync attempt {}/{} failed: {}",
                        failures, self.settings.sync_attempts, err
                    );
                    self.handle.fail(ConnectionState::SyncFailed, &err);
                    if failures >= self.settings.sync_attempts {
                        return Err(err);
                    }
                    pause(channel, self.settings.backoff(failures)).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn install<S>(
        &self,
        channel: &mut Channel<S>,
        desired: &DesiredState,
    ) -> Result<Install, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let clear = vec![
            (
                "delete all flows".to_string(),
                Message::FlowMod(FlowMod::delete_all()),
            ),
            (
                "delete all groups".to_string(),
                Message::GroupMod(GroupMod::delete_all()),
            ),
        ];
        let group = vec![(
            format!("group[{}]", desired.group.id),
            Message::GroupMod(desired.group.to_group_mod()),
        )];
        let flows = desired
            .flows
            .iter()
            .map(|rule| (rule.label(), Message::FlowMod(rule.to_flow_mod())))
            .collect();

        for (stage, batch) in [("clear", clear), ("group", group), ("flows", flows)] {
            debug!("sending {} batch", stage);
            if self.batch(channel, batch).await? == Install::Preempted {
                return Ok(Install::Preempted);
            }
        }
        Ok(Install::Complete)
    }

    /// Sends a barrier-terminated batch. Errors are matched to entities by
    /// xid; anything that answers an older xid is stale and ignored.
    async fn batch<S>(
        &self,
        channel: &mut Channel<S>,
        batch: Vec<(String, Message)>,
    ) -> Result<Install, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pending = HashMap::with_capacity(batch.len());
        for (label, msg) in batch {
            if self.preempted() {
                return Ok(Install::Preempted);
            }
            let xid = channel.send(&msg).await?;
            pending.insert(xid, label);
        }
        let barrier = channel.send(&Message::BarrierRequest).await?;

        let deadline = Instant::now() + channel.timeout();
        let mut failure = None;
        loop {
            let (header, msg) = time::timeout_at(deadline, channel.recv())
                .await
                .map_err(|_| SessionError::InstallTimeout("barrier reply"))??;
            match msg {
                Message::BarrierReply if header.xid == barrier => break,
                Message::Error(err) => match pending.get(&header.xid) {
                    Some(entity) => {
                        error!(
                            "switch rejected {}: error type {} code {}",
                            entity, err.err_type, err.code
                        );
                        failure.get_or_insert(SessionError::Installation {
                            entity: entity.clone(),
                            err_type: err.err_type,
                            code: err.code,
                        });
                    }
                    None => debug!("ignoring stale error for xid {}", header.xid),
                },
                other => debug!(
                    "ignoring message type {} xid {} during install",
                    other.msg_type(),
                    header.xid
                ),
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(Install::Complete),
        }
    }

    async fn steady<S>(&mut self, channel: &mut Channel<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let interval = self.settings.echo_interval();
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        let mut outstanding: Option<(u32, Instant)> = None;

        loop {
            tokio::select! {
                frame = channel.recv() => {
                    let (header, msg) = frame?;
                    match msg {
                        Message::EchoReply(_) if outstanding.map_or(false, |(xid, _)| xid == header.xid) => {
                            outstanding = None;
                        }
                        Message::Error(err) => warn!(
                            "switch reported error type {} code {} for xid {}",
                            err.err_type, err.code, header.xid
                        ),
                        other => debug!("ignoring message type {} from switch", other.msg_type()),
                    }
                }
                _ = ticker.tick() => match outstanding {
                    Some((_, sent)) if sent.elapsed() >= self.settings.timeout() => {
                        return Err(ChannelError::Timeout("echo reply").into());
                    }
                    Some(_) => {}
                    None => {
                        let xid = channel.send(&Message::EchoRequest(Vec::new())).await?;
                        outstanding = Some((xid, Instant::now()));
                    }
                },
                changed = self.desired.changed() => {
                    if changed.is_err() {
                        info!("controller is shutting down, leaving session");
                        return Ok(());
                    }
                    info!("desired state changed, resyncing switch");
                    self.sync(channel).await?;
                    outstanding = None;
                }
            }
        }
    }
}

/// Waits out a backoff while still serving the switch's echo requests.
async fn pause<S>(channel: &mut Channel<S>, duration: Duration) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let sleep = time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            frame = channel.recv() => {
                let (header, msg) = frame?;
                debug!("ignoring message type {} xid {} during backoff", msg.msg_type(), header.xid);
            }
        }
    }
}

/// Checks the peer's HELLO against the single version spoken here.
fn negotiate(peer_version: u8, bitmap: Option<u32>) -> Result<(), String> {
    match bitmap {
        Some(bits) if bits & (1 << OFP_VERSION) != 0 => Ok(()),
        Some(bits) => Err(format!(
            "switch version bitmap {bits:#x} does not include OpenFlow 1.3"
        )),
        None if peer_version >= OFP_VERSION => Ok(()),
        None => Err(format!(
            "switch speaks wire version {peer_version}, OpenFlow 1.3 (wire version {OFP_VERSION}) required"
        )),
    }
}

fn handshake_error(err: ChannelError) -> SessionError {
    match err {
        ChannelError::Timeout(what) => {
            SessionError::Negotiation(format!("timed out waiting for {what}"))
        }
        err => err.into(),
    }
}

fn unexpected(what: &str, msg: &Message) -> SessionError {
    match msg {
        Message::Error(err) => SessionError::Negotiation(format!(
            "switch rejected {what}: error type {} code {}",
            err.err_type, err.code
        )),
        other => SessionError::Negotiation(format!(
            "unexpected message type {} in reply to {what}",
            other.msg_type()
        )),
    }
}

async fn request<S>(
    channel: &mut Channel<S>,
    msg: Message,
    what: &'static str,
) -> Result<Message, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let xid = channel.send(&msg).await?;
    let deadline = Instant::now() + channel.timeout();
    loop {
        let (header, reply) = time::timeout_at(deadline, channel.recv())
            .await
            .map_err(|_| handshake_error(ChannelError::Timeout(what)))??;
        if header.xid == xid {
            return Ok(reply);
        }
        debug!("ignoring xid {} while waiting for {}", header.xid, what);
    }
}

async fn handshake<S>(
    channel: &mut Channel<S>,
) -> Result<(SwitchFeatures, Option<SwitchDesc>), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel
        .send(&Message::Hello {
            versions: Some(version_bitmap(&[OFP_VERSION])),
        })
        .await?;
    let (header, hello) = channel
        .recv_timeout("switch hello")
        .await
        .map_err(handshake_error)?;
    let versions = match hello {
        Message::Hello { versions } => versions,
        other => return Err(unexpected("hello", &other)),
    };
    if let Err(reason) = negotiate(header.version, versions) {
        let refusal = Message::Error(ErrorMsg {
            err_type: OFPET_HELLO_FAILED,
            code: OFPHFC_INCOMPATIBLE,
            data: reason.clone().into_bytes(),
        });
        if let Err(err) = channel.send_xid(header.xid, &refusal).await {
            debug!("could not send HELLO_FAILED: {}", err);
        }
        return Err(SessionError::Negotiation(reason));
    }

    let features = match request(channel, Message::FeaturesRequest, "features reply").await? {
        Message::FeaturesReply(features) => features,
        other => return Err(unexpected("features request", &other)),
    };

    let group_features = Message::MultipartRequest {
        kind: OFPMP_GROUP_FEATURES,
    };
    match request(channel, group_features, "group features").await? {
        Message::MultipartReply {
            body: MultipartBody::GroupFeatures(gf),
            ..
        } if gf.supports_select() => {
            debug!(
                "switch supports up to {} select groups",
                gf.max_select_groups()
            );
        }
        Message::MultipartReply {
            body: MultipartBody::GroupFeatures(_),
            ..
        } => {
            return Err(SessionError::Negotiation(
                "switch does not support SELECT groups".to_string(),
            ))
        }
        other => return Err(unexpected("group features request", &other)),
    }

    let desc_request = Message::MultipartRequest { kind: OFPMP_DESC };
    let desc = match request(channel, desc_request, "switch description").await? {
        Message::MultipartReply {
            body: MultipartBody::Desc(desc),
            ..
        } => {
            info!(
                "switch {:016x} is {} {} ({})",
                features.datapath_id, desc.mfr_desc, desc.hw_desc, desc.sw_desc
            );
            Some(desc)
        }
        other => {
            warn!("switch did not describe itself: message type {}", other.msg_type());
            None
        }
    };

    Ok((features, desc))
}
