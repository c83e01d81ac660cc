use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use network_types::ip::IpProto;
use oflb::config::Config;
use oflb::controller::ControllerContext;
use oflb::error::ControllerError;
use oflb_common::{parse_ip_proto, FiveTuple};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

#[derive(Debug, Parser)]
#[clap(version, about = "L4 load balancer controller for OpenFlow 1.3 switches")]
struct Opt {
    #[clap(short, long)]
    config: PathBuf,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Program the switch and keep it in sync (the default)
    Run(RunOpt),
    /// Print the compiled group and flow rules as JSON
    Compile,
    /// Show which backend a client connection is balanced to
    Select(SelectOpt),
}

#[derive(Debug, Default, Args)]
struct RunOpt {
    /// Accept the switch's connection on this address
    #[clap(long, conflicts_with = "connect")]
    listen: Option<String>,
    /// Dial the switch at this address instead of listening
    #[clap(long)]
    connect: Option<String>,
    /// Exit as soon as the switch has been synced
    #[clap(long)]
    once: bool,
}

#[derive(Debug, Args)]
struct SelectOpt {
    #[clap(long)]
    src: Ipv4Addr,
    #[clap(long)]
    sport: u16,
    /// Defaults to the vip
    #[clap(long)]
    dst: Option<Ipv4Addr>,
    #[clap(long, default_value_t = 80)]
    dport: u16,
    #[clap(long, default_value = "tcp", value_parser = parse_proto)]
    proto: IpProto,
}

fn parse_proto(s: &str) -> Result<IpProto, String> {
    parse_ip_proto(s).ok_or_else(|| format!("unsupported protocol {s:?}, expected tcp or udp"))
}

fn context(config: Config) -> Result<ControllerContext, ControllerError> {
    Ok(ControllerContext::new(config)?)
}

async fn reload_on_hangup(ctx: &ControllerContext, path: &Path) -> Result<(), anyhow::Error> {
    let mut hangup =
        unix_signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        info!("SIGHUP: reloading {}", path.display());
        let config = match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("keeping current topology: {:#}", e);
                continue;
            }
        };
        let mut settings = config.controller.clone();
        settings.listen = ctx.settings().listen.clone();
        settings.connect = ctx.settings().connect.clone();
        if settings != *ctx.settings() {
            warn!("controller settings only take effect on restart");
        }
        match ctx.reload(config.topology) {
            Ok(true) => info!("topology changed"),
            Ok(false) => info!("topology unchanged"),
            Err(e) => warn!("keeping current topology: {}", e),
        }
    }
    Ok(())
}

async fn run(opt: Opt) -> Result<(), anyhow::Error> {
    let mut config = Config::load(&opt.config).map_err(ControllerError::LoadConfig)?;

    match opt.command.unwrap_or_else(|| Command::Run(RunOpt::default())) {
        Command::Compile => {
            let ctx = context(config)?;
            println!("{}", serde_json::to_string_pretty(&*ctx.desired())?);
        }
        Command::Select(select) => {
            let ctx = context(config)?;
            let tuple = FiveTuple {
                source_addr: select.src,
                source_port: select.sport,
                dst_addr: select.dst.unwrap_or(ctx.desired().vip),
                dst_port: select.dport,
                proto: select.proto,
            };
            match ctx.select(&tuple) {
                Some(bucket) => {
                    let backend = bucket.backend;
                    println!(
                        "{} -> {} ({} {} port {})",
                        tuple, backend.id, backend.ip, backend.mac, backend.port
                    );
                }
                None => println!("{} does not target the vip", tuple),
            }
        }
        Command::Run(run_opt) => {
            if let Some(listen) = run_opt.listen {
                config.controller.listen = listen;
            }
            if run_opt.connect.is_some() {
                config.controller.connect = run_opt.connect;
            }
            let ctx = context(config)?;
            let desired = ctx.desired();
            info!(
                "serving vip {} ({}) with {} backends",
                desired.vip,
                desired.lb_mac,
                desired.group.buckets.len()
            );

            tokio::select! {
                result = ctx.run(run_opt.once) => result?,
                result = reload_on_hangup(&ctx, &opt.config) => result?,
                result = signal::ctrl_c() => {
                    result?;
                    info!("Exiting...");
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();

    match run(opt).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// 1 for configuration problems, 2 for everything that fails at runtime.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ControllerError>()
        .map_or(2, ControllerError::exit_code)
}
