use log::{info, warn};
use netwatch::logging::setup_logging;
use netwatch::{
    Config, ConnectionSource, IpApiProvider, MonitorEvent, NetworkMonitor, ProcessNameResolver,
    RawConnection, SampleError, Snapshot, ThreatLevel,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// `ss`-based connection enumeration. The engine itself never shells out;
/// this is the host-platform collaborator the console binary plugs in.
struct SsConnectionSource;

impl ConnectionSource for SsConnectionSource {
    fn list_connections(&self) -> Result<Vec<RawConnection>, SampleError> {
        let output = Command::new("ss")
            .args(["-H", "-t", "-u", "-n", "-a", "-p"])
            .output()
            .map_err(|e| SampleError::Enumeration(format!("cannot run ss: {}", e)))?;
        if !output.status.success() {
            return Err(SampleError::Enumeration(format!(
                "ss exited with {}",
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(parse_ss_line).collect())
    }
}

/// Parse one `ss -H -tunap` line, e.g.
/// `tcp ESTAB 0 0 192.168.1.5:51234 142.250.74.14:443 users:(("firefox",pid=1234,fd=89))`
fn parse_ss_line(line: &str) -> Option<RawConnection> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }

    let protocol = parts[0].to_string();
    let state = parts[1].to_string();
    let (local_addr, local_port) = split_addr_port(parts[4])?;
    let (remote_addr, remote_port) = split_addr_port(parts[5])?;

    // Pick the pid out of the users: column when present.
    let pid = parts.get(6).and_then(|s| {
        s.split("pid=")
            .nth(1)
            .and_then(|p| p.split([',', ')']).next())
            .and_then(|p| p.parse().ok())
    });

    Some(RawConnection {
        protocol,
        state,
        // Wildcard listeners ("*:22") keep the unspecified address.
        local_addr: local_addr.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        local_port,
        remote_addr,
        remote_port,
        pid,
    })
}

/// Split "addr:port" into its parts. Wildcards ("*", port "*") and v6
/// brackets/scope ids are tolerated; a wildcard address comes back as None.
fn split_addr_port(field: &str) -> Option<(Option<IpAddr>, u16)> {
    let pos = field.rfind(':')?;
    let addr_part = field[..pos].trim_matches(['[', ']']);
    let port = field[pos + 1..].parse::<u16>().unwrap_or(0);
    let addr = match addr_part {
        "" | "*" => None,
        other => other.split('%').next().and_then(|a| a.parse::<IpAddr>().ok()),
    };
    Some((addr, port))
}

/// Pid-to-name via procfs.
struct ProcfsNameResolver;

impl ProcessNameResolver for ProcfsNameResolver {
    fn process_name(&self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
        let name = comm.trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

fn find_config() -> PathBuf {
    if let Some(arg) = std::env::args().nth(1) {
        return PathBuf::from(arg);
    }
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    if exe_dir.join("config.yaml").exists() {
        exe_dir.join("config.yaml")
    } else if Path::new("config.yaml").exists() {
        PathBuf::from("config.yaml")
    } else {
        PathBuf::from("/etc/netwatch/config.yaml")
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = find_config();
    let config = if config_path.exists() {
        match Config::load(&config_path) {
            Ok(cfg) => {
                println!("Configuration loaded from {}", config_path.display());
                cfg
            }
            Err(e) => {
                eprintln!("Failed to load config ({}), using defaults", e);
                Config::default()
            }
        }
    } else {
        eprintln!(
            "Config not found at {}, using defaults",
            config_path.display()
        );
        Config::default()
    };

    setup_logging(&config.logging)?;
    info!("netwatch starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("netwatch - network connection monitor");
    println!(
        "Polling every {}s; press Ctrl+C to stop\n",
        config.monitoring.poll_interval_seconds
    );

    let monitor = NetworkMonitor::new(
        &config,
        Arc::new(SsConnectionSource),
        Arc::new(ProcfsNameResolver),
        Arc::new(IpApiProvider::new()),
    )?;

    let mut events = monitor.subscribe();
    monitor.start().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MonitorEvent::Snapshot(snapshot)) => print_snapshot(&snapshot),
                Ok(MonitorEvent::TickError { message, .. }) => {
                    warn!("tick failed: {}", message);
                    eprintln!("tick failed: {}", message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("console fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                info!("shutdown signal received");
                monitor.stop().await;
                break;
            }
        }
    }

    Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
    let stats = &snapshot.stats;
    println!(
        "[{}] {} connections ({} TCP / {} UDP), {} established, {} unique remotes",
        snapshot.timestamp.format("%H:%M:%S"),
        stats.total_connections,
        stats.tcp_count,
        stats.udp_count,
        stats.established_count,
        stats.unique_remote_ips
    );

    for rec in &snapshot.records {
        if rec.threat.level >= ThreatLevel::Medium {
            let country = rec
                .geo
                .as_ref()
                .filter(|g| !g.is_negative)
                .map(|g| g.country_code.as_str())
                .unwrap_or("?");
            println!(
                "  !! {} {}:{} -> {}:{} [{}] process={} country={} reasons={}",
                rec.threat.level.as_str(),
                rec.conn.local_addr,
                rec.conn.local_port,
                rec.conn.remote_addr,
                rec.conn.remote_port,
                rec.conn.protocol.as_str(),
                rec.conn.process_label(),
                country,
                rec.threat.reasons.join(",")
            );
            info!(
                "threat {}: {}:{} -> {}:{} process={} reasons={}",
                rec.threat.level.as_str(),
                rec.conn.local_addr,
                rec.conn.local_port,
                rec.conn.remote_addr,
                rec.conn.remote_port,
                rec.conn.process_label(),
                rec.threat.reasons.join(",")
            );
        }
    }
}
