#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use oflb::channel::Channel;
use oflb::compiler::DesiredState;
use oflb::config::{Config, ControllerSettings};
use oflb::controller::ControllerContext;
use oflb::error::ChannelError;
use oflb::session::SwitchSession;
use oflb_common::ofp::{
    version_bitmap, ErrorMsg, FlowMod, GroupFeatures, GroupMod, Message, MultipartBody,
    SwitchDesc, SwitchFeatures, OFPFC_ADD, OFPFC_DELETE, OFPGC_ADD, OFPGC_DELETE, OFPG_ALL,
    OFPMP_DESC, OFPMP_GROUP_FEATURES, OFPTT_ALL, OFPT_HELLO, OFP_VERSION,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

pub const DATAPATH_ID: u64 = 0xaa;

pub const OFPET_BAD_REQUEST: u16 = 1;
pub const OFPBRC_BAD_MULTIPART: u16 = 2;
pub const OFPET_GROUP_MOD_FAILED: u16 = 6;
pub const OFPGMFC_GROUP_EXISTS: u16 = 0;
pub const OFPGMFC_OUT_OF_GROUPS: u16 = 1;

pub const TOPOLOGY: &str = r#"
vip: 10.0.0.100
lbMac: "00:00:00:00:00:ff"
backends:
  - { id: h3, ip: 10.0.0.3, mac: "00:00:00:00:00:03", port: 3 }
  - { id: h4, ip: 10.0.0.4, mac: "00:00:00:00:00:04", port: 4 }
  - { id: h5, ip: 10.0.0.5, mac: "00:00:00:00:00:05", port: 5 }
clientPorts: [1, 2]
"#;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Settings tuned so failure paths finish in milliseconds.
pub fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        timeout_ms: 1_000,
        echo_interval_ms: 50,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..ControllerSettings::default()
    }
}

pub fn config(settings: ControllerSettings) -> Config {
    let mut config: Config = serde_yaml::from_str(TOPOLOGY).unwrap();
    config.controller = settings;
    config
}

pub fn context(settings: ControllerSettings) -> ControllerContext {
    init_logging();
    ControllerContext::new(config(settings)).unwrap()
}

/// The switch tables a sync of `desired` must leave behind.
pub fn expected_tables(desired: &DesiredState) -> Tables {
    Tables {
        flows: desired.flow_mods(),
        groups: vec![desired.group.to_group_mod()],
    }
}

/// Polls the session snapshot until `done` holds.
pub async fn wait_until(
    ctx: &ControllerContext,
    what: &str,
    done: impl Fn(&SwitchSession) -> bool,
) -> SwitchSession {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = ctx.snapshot();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub flows: Vec<FlowMod>,
    pub groups: Vec<GroupMod>,
}

/// Runs inside the switch just before it answers its first barrier.
#[derive(Clone)]
pub struct BarrierHook(Arc<dyn Fn() + Send + Sync>);

impl BarrierHook {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        BarrierHook(Arc::new(f))
    }
}

impl fmt::Debug for BarrierHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BarrierHook")
    }
}

#[derive(Debug, Clone)]
pub struct Behavior {
    /// Wire version of the switch HELLO. Anything but 1.3 is sent bare.
    pub hello_version: u8,
    pub select_groups: bool,
    /// Group ADDs to refuse with OUT_OF_GROUPS before accepting any.
    pub reject_group_adds: usize,
    pub answer_barriers: bool,
    pub answer_echo: bool,
    pub before_first_barrier_reply: Option<BarrierHook>,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            hello_version: OFP_VERSION,
            select_groups: true,
            reject_group_adds: 0,
            answer_barriers: true,
            answer_echo: true,
            before_first_barrier_reply: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    rejections_left: usize,
    barriers: usize,
    received: Vec<Message>,
}

/// In-process OpenFlow 1.3 switch that keeps its flow and group tables
/// across connections.
#[derive(Debug, Clone, Default)]
pub struct FakeSwitch {
    behavior: Behavior,
    state: Arc<Mutex<State>>,
}

impl FakeSwitch {
    pub fn new(behavior: Behavior) -> Self {
        let state = State {
            rejections_left: behavior.reject_group_adds,
            ..State::default()
        };
        FakeSwitch {
            behavior,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn tables(&self) -> Tables {
        self.lock().tables.clone()
    }

    pub fn set_tables(&self, tables: Tables) {
        self.lock().tables = tables;
    }

    pub fn received(&self) -> Vec<Message> {
        self.lock().received.clone()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }

    /// Serves one controller connection until the controller hangs up.
    pub async fn serve<S>(&self, stream: S) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = self.greet(stream).await?;
        self.serve_channel(&mut channel).await
    }

    /// Sends the switch HELLO and frames the connection.
    pub async fn greet<S>(&self, mut stream: S) -> Result<Channel<S>, ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.behavior.hello_version == OFP_VERSION {
            let hello = Message::Hello {
                versions: Some(version_bitmap(&[1, OFP_VERSION])),
            };
            stream.write_all(&hello.encode(1)?).await?;
        } else {
            let bare = [self.behavior.hello_version, OFPT_HELLO, 0, 8, 0, 0, 0, 1];
            stream.write_all(&bare).await?;
        }
        Ok(Channel::new(stream, Duration::from_secs(5)))
    }

    pub async fn serve_channel<S>(&self, channel: &mut Channel<S>) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let (header, msg) = match channel.read_frame().await {
                Ok(frame) => frame,
                Err(ChannelError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let reply = self.handle(&msg);
            self.lock().received.push(msg);
            if let Some(reply) = reply {
                channel.send_xid(header.xid, &reply).await?;
            }
        }
    }

    fn handle(&self, msg: &Message) -> Option<Message> {
        let mut state = self.lock();
        match msg {
            Message::EchoRequest(data) => self
                .behavior
                .answer_echo
                .then(|| Message::EchoReply(data.clone())),
            Message::FeaturesRequest => Some(Message::FeaturesReply(SwitchFeatures {
                datapath_id: DATAPATH_ID,
                n_buffers: 0,
                n_tables: 254,
                auxiliary_id: 0,
                capabilities: 0,
            })),
            Message::MultipartRequest {
                kind: OFPMP_GROUP_FEATURES,
            } => {
                let types = if self.behavior.select_groups { 0b1111 } else { 0b0101 };
                Some(Message::MultipartReply {
                    flags: 0,
                    body: MultipartBody::GroupFeatures(GroupFeatures {
                        types,
                        capabilities: 0,
                        max_groups: [4096; 4],
                        actions: [0; 4],
                    }),
                })
            }
            Message::MultipartRequest { kind: OFPMP_DESC } => Some(Message::MultipartReply {
                flags: 0,
                body: MultipartBody::Desc(SwitchDesc {
                    mfr_desc: "oflb".to_string(),
                    hw_desc: "fake switch".to_string(),
                    sw_desc: "1.0".to_string(),
                    ..SwitchDesc::default()
                }),
            }),
            Message::MultipartRequest { .. } => Some(error(OFPET_BAD_REQUEST, OFPBRC_BAD_MULTIPART)),
            Message::FlowMod(fm) if fm.command == OFPFC_DELETE => {
                if fm.table_id == OFPTT_ALL {
                    state.tables.flows.clear();
                } else {
                    state.tables.flows.retain(|f| f.table_id != fm.table_id);
                }
                None
            }
            Message::FlowMod(fm) if fm.command == OFPFC_ADD => {
                let existing = state.tables.flows.iter_mut().find(|f| {
                    f.table_id == fm.table_id && f.priority == fm.priority && f.r#match == fm.r#match
                });
                match existing {
                    Some(f) => *f = fm.clone(),
                    None => state.tables.flows.push(fm.clone()),
                }
                None
            }
            Message::GroupMod(gm) if gm.command == OFPGC_DELETE => {
                if gm.group_id == OFPG_ALL {
                    state.tables.groups.clear();
                } else {
                    state.tables.groups.retain(|g| g.group_id != gm.group_id);
                }
                None
            }
            Message::GroupMod(gm) if gm.command == OFPGC_ADD => {
                if state.rejections_left > 0 {
                    state.rejections_left -= 1;
                    return Some(error(OFPET_GROUP_MOD_FAILED, OFPGMFC_OUT_OF_GROUPS));
                }
                if state.tables.groups.iter().any(|g| g.group_id == gm.group_id) {
                    return Some(error(OFPET_GROUP_MOD_FAILED, OFPGMFC_GROUP_EXISTS));
                }
                state.tables.groups.push(gm.clone());
                None
            }
            Message::BarrierRequest => {
                state.barriers += 1;
                if state.barriers == 1 {
                    if let Some(hook) = &self.behavior.before_first_barrier_reply {
                        (hook.0)();
                    }
                }
                self.behavior.answer_barriers.then_some(Message::BarrierReply)
            }
            _ => None,
        }
    }
}

fn error(err_type: u16, code: u16) -> Message {
    Message::Error(ErrorMsg {
        err_type,
        code,
        data: Vec::new(),
    })
}

/// Short names for the table-changing messages a switch saw, in order.
pub fn table_ops(received: &[Message]) -> Vec<&'static str> {
    received
        .iter()
        .filter_map(|msg| match msg {
            Message::FlowMod(fm) if fm.command == OFPFC_DELETE => Some("delete flows"),
            Message::FlowMod(_) => Some("add flow"),
            Message::GroupMod(gm) if gm.command == OFPGC_DELETE => Some("delete groups"),
            Message::GroupMod(_) => Some("add group"),
            Message::BarrierRequest => Some("barrier"),
            _ => None,
        })
        .collect()
}
