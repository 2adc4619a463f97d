//! The Zlomek FS daemon.
//!
//! Wires the runtime together: loads the configuration, opens the kernel
//! device, starts the worker pools and the peer listener, connects to the
//! configured peers and then serves until a signal or device detach asks
//! it to stop.

use std::net::{TcpListener, TcpStream};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use zlomekfs::config::{Config, WorkerConfig};
use zlomekfs::dispatch::{self, RequestSource};
use zlomekfs::kernel_channel::KernelChannel;
use zlomekfs::network::{reader_loop, PeerConn, DEFAULT_PORT};
use zlomekfs::proto::{ConnectionSpeed, Opcode};
use zlomekfs::worker::{PoolLimits, WorkerPool, SHUTDOWN_GRACE};
use zlomekfs::Runtime;

#[derive(Debug, Parser)]
#[command(name = "zfsd", about = "Zlomek FS daemon", version)]
struct Args {
    /// Path of the configuration file.
    #[arg(short, long, default_value = "/etc/zfsd/zfsd.conf")]
    config: std::path::PathBuf,

    /// Override the node name from the configuration.
    #[arg(short = 'n', long)]
    node_name: Option<String>,

    /// Override the kernel device path.
    #[arg(short = 'd', long)]
    device: Option<std::path::PathBuf>,

    /// Log filter, e.g. `info` or `zlomekfs=debug`.
    #[arg(short, long, default_value = "info")]
    log: String,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn pool_limits(workers: &WorkerConfig) -> PoolLimits {
    PoolLimits {
        min_spare: workers.min_spare,
        max_spare: workers.max_spare,
        max_threads: workers.max_threads,
        ..PoolLimits::default()
    }
}

/// Dial a configured peer and run the two-stage handshake.
fn connect_peer(
    rt: &Arc<Runtime>,
    pool: &Arc<WorkerPool<(Arc<PeerConn>, Vec<u8>)>>,
    peer: &zlomekfs::node::Node,
) -> Result<(), String> {
    let addr = (peer.host_name.as_str(), DEFAULT_PORT);
    let stream = TcpStream::connect(addr).map_err(|e| e.to_string())?;
    let conn = PeerConn::new(stream).map_err(|e| e.to_string())?;

    let reader_conn = conn.clone();
    let reader_pool = pool.clone();
    let sid = rt.this_node.id;
    std::thread::Builder::new()
        .name(format!("peer-{}", peer.name))
        .spawn(move || {
            reader_loop(reader_conn, sid, move |conn, frame| {
                if reader_pool.dispatch((conn, frame)).is_err() {
                    warn!("dropping peer request during shutdown");
                }
            });
        })
        .map_err(|e| e.to_string())?;

    let name = rt.this_node.name.clone();
    let reply = conn
        .call(Opcode::AuthStage1, sid, |dc| dc.encode_str(name.as_bytes()))
        .map_err(|e| e.to_string())?;
    let mut r = reply.reader().map_err(|e| e.to_string())?;
    let peer_name = zlomekfs::proto::decode_nodename(&mut r).map_err(|e| e.to_string())?;
    if peer_name != peer.name.as_bytes() {
        conn.teardown(zlomekfs::ZfsError::ConnectionLost);
        return Err(format!(
            "peer identified as {}, expected {}",
            String::from_utf8_lossy(peer_name),
            peer.name
        ));
    }
    conn.set_stage1(&peer.name, peer.id);

    conn.call(Opcode::AuthStage2, sid, |dc| {
        ConnectionSpeed::Fast.encode(dc)
    })
    .map_err(|e| e.to_string())?;
    conn.set_stage2(ConnectionSpeed::Fast);
    peer.set_conn(conn);
    info!("connected to {}", peer.name);
    Ok(())
}

fn serve(rt: Arc<Runtime>) -> Result<(), (u8, String)> {
    // Network pool and listener first, so peers can reach us while the
    // kernel side comes up.
    let net_rt = rt.clone();
    let network_pool: Arc<WorkerPool<(Arc<PeerConn>, Vec<u8>)>> = WorkerPool::new(
        "network",
        pool_limits(&rt.config.network_workers),
        move |(conn, frame): (Arc<PeerConn>, Vec<u8>)| {
            if let Some(reply) = dispatch::handle_frame(&net_rt, RequestSource::Peer(&conn), &frame)
            {
                if let Err(err) = conn.send_frame(&reply) {
                    warn!("peer reply failed: {err}");
                }
            }
        },
    );

    let listener = TcpListener::bind(("0.0.0.0", rt.config.listen_port))
        .map_err(|e| (2, format!("cannot bind port {}: {e}", rt.config.listen_port)))?;
    info!("listening on port {}", rt.config.listen_port);
    {
        let rt = rt.clone();
        let pool = network_pool.clone();
        std::thread::Builder::new()
            .name("accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    if !rt.is_running() {
                        break;
                    }
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!("accept failed: {err}");
                            continue;
                        }
                    };
                    let conn = match PeerConn::new(stream) {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!("peer setup failed: {err}");
                            continue;
                        }
                    };
                    let pool = pool.clone();
                    let sid = rt.this_node.id;
                    let result = std::thread::Builder::new().name("peer-in".into()).spawn(
                        move || {
                            reader_loop(conn, sid, move |conn, frame| {
                                if pool.dispatch((conn, frame)).is_err() {
                                    warn!("dropping peer request during shutdown");
                                }
                            });
                        },
                    );
                    if let Err(err) = result {
                        warn!("cannot spawn peer reader: {err}");
                    }
                }
            })
            .map_err(|e| (2, format!("cannot spawn acceptor: {e}")))?;
    }

    for peer in rt.nodes.all() {
        if peer.id == rt.this_node.id {
            continue;
        }
        if let Err(err) = connect_peer(&rt, &network_pool, &peer) {
            warn!("cannot reach {}: {err}", peer.name);
        }
    }

    // Kernel side: its own pool plus the channel loop on this thread.
    let channel = Arc::new(
        KernelChannel::open(&rt.config.kernel_device).map_err(|e| {
            (
                2,
                format!("cannot open {}: {e}", rt.config.kernel_device.display()),
            )
        })?,
    );
    let kernel_rt = rt.clone();
    let kernel_channel = channel.clone();
    let kernel_pool: Arc<WorkerPool<Vec<u8>>> = WorkerPool::new(
        "kernel",
        pool_limits(&rt.config.kernel_workers),
        move |frame: Vec<u8>| {
            if let Some(reply) =
                dispatch::handle_frame(&kernel_rt, RequestSource::Kernel, &frame)
            {
                if let Err(err) = kernel_channel.write_reply(&reply) {
                    warn!("kernel reply failed: {err}");
                }
            }
        },
    );

    let run_result = {
        let pool = kernel_pool.clone();
        let mut on_frame = |frame: Vec<u8>| {
            if pool.dispatch(frame).is_err() {
                warn!("dropping kernel request during shutdown");
            }
        };
        channel.run(&RUNNING, &mut on_frame)
    };

    rt.shutdown();
    info!("draining worker pools");
    kernel_pool.shutdown(SHUTDOWN_GRACE);
    network_pool.shutdown(SHUTDOWN_GRACE);
    for peer in rt.nodes.all() {
        if let Some(conn) = peer.conn() {
            conn.teardown(zlomekfs::ZfsError::Exiting);
        }
    }
    // Give peer readers a moment to observe the teardown.
    std::thread::sleep(Duration::from_millis(50));

    run_result.map_err(|e| (2, format!("kernel channel failed: {e}")))
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::new().parse_filters(&args.log).init();
    install_signal_handlers();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(1);
        }
    };
    if let Some(name) = args.node_name {
        config.node_name = name;
    }
    if let Some(device) = args.device {
        config.kernel_device = device;
    }

    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(err) => {
            error!("cannot initialize runtime: {err}");
            return ExitCode::from(1);
        }
    };
    info!(
        "zfsd starting as node {} ({})",
        rt.this_node.id, rt.this_node.name
    );

    match serve(rt) {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err((code, message)) => {
            error!("{message}");
            ExitCode::from(code)
        }
    }
}
