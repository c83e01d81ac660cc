use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use oflb_common::FiveTuple;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time;

use crate::compiler::{compile, Bucket, DesiredState};
use crate::config::{Config, ControllerSettings, Topology};
use crate::error::{ChannelError, ConfigError, ControllerError, SessionError};
use crate::hash::FlowSelector;
use crate::session::{Session, SessionHandle, SwitchSession};

/// Everything one controller instance owns: the topology, its compiled
/// desired state and the switch session.
pub struct ControllerContext {
    settings: ControllerSettings,
    topology: Mutex<Topology>,
    desired: watch::Sender<Arc<DesiredState>>,
    selection: Mutex<Selection>,
    session: SessionHandle,
}

/// A desired state paired with the ring built from its group weights.
#[derive(Clone)]
struct Selection {
    desired: Arc<DesiredState>,
    selector: Arc<FlowSelector>,
}

impl Selection {
    fn new(desired: Arc<DesiredState>, settings: &ControllerSettings) -> Self {
        let selector = Arc::new(desired.selector(settings.ring_size, settings.hash_seed));
        Selection { desired, selector }
    }
}

#[derive(Debug, Default)]
struct Retries {
    negotiation: u32,
    channel: u32,
}

impl ControllerContext {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.controller.validate()?;
        let desired = Arc::new(compile(&config.topology, config.controller.ring_size)?);
        let selection = Selection::new(desired.clone(), &config.controller);
        let (desired, _) = watch::channel(desired);
        Ok(ControllerContext {
            settings: config.controller,
            topology: Mutex::new(config.topology),
            desired,
            selection: Mutex::new(selection),
            session: SessionHandle::default(),
        })
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn topology(&self) -> Topology {
        self.topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn desired(&self) -> Arc<DesiredState> {
        self.desired.borrow().clone()
    }

    pub fn snapshot(&self) -> SwitchSession {
        self.session.snapshot()
    }

    fn selection(&self) -> Selection {
        self.selection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The selection ring for the current desired state. It is rebuilt only
    /// when a reload changes that state.
    pub fn selector(&self) -> Arc<FlowSelector> {
        self.selection().selector
    }

    /// The bucket the forward rule sends `tuple` to, if it targets the VIP.
    pub fn select(&self, tuple: &FiveTuple) -> Option<Bucket> {
        let Selection { desired, selector } = self.selection();
        desired.bucket_for(tuple, &selector).cloned()
    }

    /// Replaces the topology. Returns whether the desired state changed, in
    /// which case a connected session performs a full resync. An invalid
    /// topology leaves the current one in place.
    pub fn reload(&self, topology: Topology) -> Result<bool, ConfigError> {
        let desired = compile(&topology, self.settings.ring_size)?;
        *self
            .topology
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = topology;

        let unchanged = **self.desired.borrow() == desired;
        if unchanged {
            return Ok(false);
        }
        let desired = Arc::new(desired);
        *self
            .selection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Selection::new(desired.clone(), &self.settings);
        self.desired.send_replace(desired);
        Ok(true)
    }

    /// A session wired to this context's desired state and snapshot.
    pub fn session(&self) -> Session {
        Session::new(
            self.settings.clone(),
            self.session.clone(),
            self.desired.subscribe(),
        )
    }

    /// Serves the switch until a retry budget runs out. With `once` this
    /// returns after the first completed sync.
    pub async fn run(&self, once: bool) -> Result<(), ControllerError> {
        let mut session = self.session();
        let mut retries = Retries::default();

        if let Some(addr) = &self.settings.connect {
            loop {
                let connect = time::timeout(self.settings.timeout(), TcpStream::connect(addr));
                let stream = match connect.await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        warn!("cannot reach switch at {}: {}", addr, err);
                        self.after_failure(&mut retries, ChannelError::Io(err).into())
                            .await?;
                        continue;
                    }
                    Err(_) => {
                        let err = ChannelError::Timeout("switch connection");
                        warn!("cannot reach switch at {}: {}", addr, err);
                        self.after_failure(&mut retries, err.into()).await?;
                        continue;
                    }
                };
                info!("connected to switch at {}", addr);
                if self.serve(&mut session, stream, once, &mut retries).await? {
                    return Ok(());
                }
            }
        }

        let listener = TcpListener::bind(&self.settings.listen)
            .await
            .map_err(|source| ControllerError::Bind {
                addr: self.settings.listen.clone(),
                source,
            })?;
        info!("waiting for switch on {}", self.settings.listen);
        loop {
            let stream = match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("switch connected from {}", peer);
                    stream
                }
                Err(err) => {
                    warn!("accept failed: {}", err);
                    self.after_failure(&mut retries, ChannelError::Io(err).into())
                        .await?;
                    continue;
                }
            };
            if self.serve(&mut session, stream, once, &mut retries).await? {
                return Ok(());
            }
        }
    }

    /// Runs one connection. `Ok(true)` means the controller is done.
    async fn serve(
        &self,
        session: &mut Session,
        stream: TcpStream,
        once: bool,
        retries: &mut Retries,
    ) -> Result<bool, ControllerError> {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY: {}", err);
        }
        let syncs = self.session.snapshot().completed_syncs;
        let result = session.run(stream, once).await;
        if self.session.snapshot().completed_syncs > syncs {
            *retries = Retries::default();
        }
        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                self.after_failure(retries, err).await?;
                Ok(false)
            }
        }
    }

    async fn after_failure(
        &self,
        retries: &mut Retries,
        err: SessionError,
    ) -> Result<(), ControllerError> {
        let attempt = match &err {
            SessionError::Installation { .. } | SessionError::InstallTimeout(_) => {
                return Err(ControllerError::SyncExhausted {
                    attempts: self.settings.sync_attempts,
                    last: err.to_string(),
                });
            }
            SessionError::Negotiation(_) => {
                retries.negotiation += 1;
                if retries.negotiation >= self.settings.handshake_attempts {
                    return Err(ControllerError::NegotiationExhausted {
                        attempts: retries.negotiation,
                        last: err.to_string(),
                    });
                }
                retries.negotiation
            }
            SessionError::Channel(_) => {
                retries.channel += 1;
                if retries.channel >= self.settings.reconnect_attempts {
                    return Err(ControllerError::ChannelExhausted {
                        attempts: retries.channel,
                        last: err.to_string(),
                    });
                }
                retries.channel
            }
        };
        let delay = self.settings.backoff(attempt);
        warn!("{}; retrying in {:?}", err, delay);
        time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use network_types::ip::IpProto;

    use super::*;
    use crate::config::tests::sample_topology;

    fn context() -> ControllerContext {
        ControllerContext::new(Config {
            topology: sample_topology(),
            controller: ControllerSettings::default(),
        })
        .unwrap()
    }

    fn tuple(sport: u16) -> FiveTuple {
        FiveTuple {
            source_addr: Ipv4Addr::new(10, 0, 0, 1),
            source_port: sport,
            dst_addr: Ipv4Addr::new(10, 0, 0, 100),
            dst_port: 80,
            proto: IpProto::Tcp,
        }
    }

    #[test]
    fn invalid_topology_is_rejected_up_front() {
        let mut topology = sample_topology();
        topology.backends.clear();
        let err = ControllerContext::new(Config {
            topology,
            controller: ControllerSettings::default(),
        })
        .err()
        .unwrap();
        assert_eq!(err, ConfigError::NoBackends);
        assert_eq!(ControllerError::from(err).exit_code(), 1);
    }

    #[test]
    fn invalid_settings_are_rejected_up_front() {
        let controller = ControllerSettings {
            sync_attempts: 0,
            ..ControllerSettings::default()
        };
        let err = ControllerContext::new(Config {
            topology: sample_topology(),
            controller,
        })
        .err()
        .unwrap();
        assert_eq!(err, ConfigError::ZeroSetting("sync_attempts"));
    }

    #[test]
    fn fresh_context_is_disconnected() {
        let ctx = context();
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.state, crate::session::ConnectionState::Disconnected);
        assert!(snapshot.installed.is_none());
        assert_eq!(ctx.desired().flows.len(), 8);
    }

    #[test]
    fn select_matches_the_group_buckets() {
        let ctx = context();
        let ports: Vec<u32> = (40000..40010)
            .map(|p| ctx.select(&tuple(p)).unwrap().backend.port)
            .collect();
        assert_eq!(ports, vec![4, 3, 3, 5, 5, 3, 4, 3, 5, 5]);

        let mut other = tuple(40000);
        other.dst_addr = Ipv4Addr::new(10, 0, 0, 3);
        assert!(ctx.select(&other).is_none());
    }

    #[test]
    fn selector_is_rebuilt_only_when_the_group_changes() {
        let ctx = context();
        let first = ctx.selector();
        assert!(Arc::ptr_eq(&first, &ctx.selector()));

        assert!(!ctx.reload(ctx.topology()).unwrap());
        assert!(Arc::ptr_eq(&first, &ctx.selector()));

        let mut topology = ctx.topology();
        topology.backends.retain(|b| b.id != "h4");
        assert!(ctx.reload(topology).unwrap());
        let second = ctx.selector();
        assert!(!Arc::ptr_eq(&first, &second));
        let settings = ctx.settings();
        assert_eq!(
            *second,
            ctx.desired().selector(settings.ring_size, settings.hash_seed)
        );
        for p in 40000..40010 {
            assert_ne!(ctx.select(&tuple(p)).unwrap().backend.port, 4);
        }
    }

    #[test]
    fn reload_reports_changes_only() {
        let ctx = context();
        let mut rx = ctx.desired.subscribe();
        assert!(!ctx.reload(sample_topology()).unwrap());
        assert!(!rx.has_changed().unwrap());

        let mut topology = sample_topology();
        topology.backends.pop();
        assert!(ctx.reload(topology.clone()).unwrap());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().group.buckets.len(), 2);
        assert_eq!(ctx.topology(), topology);
    }

    #[test]
    fn invalid_reload_keeps_the_current_state() {
        let ctx = context();
        let before = ctx.desired();
        let mut topology = sample_topology();
        topology.client_ports.push(3);
        assert!(matches!(
            ctx.reload(topology),
            Err(ConfigError::BackendPortIsClientPort { port: 3, .. })
        ));
        assert_eq!(*ctx.desired(), *before);
        assert_eq!(ctx.topology(), sample_topology());
    }

    #[tokio::test]
    async fn listen_address_in_use_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let controller = ControllerSettings {
            listen: taken.local_addr().unwrap().to_string(),
            ..ControllerSettings::default()
        };
        let ctx = ControllerContext::new(Config {
            topology: sample_topology(),
            controller,
        })
        .unwrap();
        let err = ctx.run(false).await.unwrap_err();
        assert!(matches!(err, ControllerError::Bind { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn unreachable_switch_exhausts_the_reconnect_budget() {
        let port = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let controller = ControllerSettings {
            connect: Some(format!("127.0.0.1:{port}")),
            reconnect_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 1,
            ..ControllerSettings::default()
        };
        let ctx = ControllerContext::new(Config {
            topology: sample_topology(),
            controller,
        })
        .unwrap();
        let err = ctx.run(false).await.unwrap_err();
        assert!(
            matches!(err, ControllerError::ChannelExhausted { attempts: 2, .. }),
            "{err}"
        );
        assert_eq!(err.exit_code(), 2);
    }
}
