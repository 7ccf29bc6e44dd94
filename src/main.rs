//! MAD query tool
//!
//! Queries the subnet and performance administration services of a fabric
//! through a local port or an out-of-band management node.
//!
//! Usage:
//! ```bash
//! mad-query --hfi 1 --port 1 nodes --node-type sw
//! mad-query --oob-host fabric-mgr --tls-ca /etc/opa/ca.pem pa-counters --lid 2 --port-num 5
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mad_engine::pa::{
    FocusSelect, ImageId, FOCUS_SELECT_CONGESTION, FOCUS_SELECT_INTEGRITY, FOCUS_SELECT_UTIL_HIGH,
    FOCUS_SELECT_UTIL_LOW, FOCUS_SELECT_UTIL_PKTS_HIGH,
};
use mad_engine::sa::{NodeQuery, ServiceQuery, NODE_TYPE_FI, NODE_TYPE_SWITCH};
use mad_engine::{MadEngineConfig, RefreshMode, Session, SessionMode, TlsConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{fmt::layer, prelude::*, EnvFilter};

/// Well-known out-of-band port of the fabric management node
const DEFAULT_OOB_PORT: u16 = 3245;

#[derive(Parser)]
#[command(
    name = "mad-query",
    about = "Query fabric management services over MADs",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Local device name (e.g. hfi1_0)
    #[arg(short, long)]
    device: Option<String>,

    /// Local port number, 0 for the first active port
    #[arg(short, long, default_value_t = 0)]
    port: u8,

    /// 1-based device index, 0 for the first device
    #[arg(long, default_value_t = 0)]
    hfi: u32,

    /// Management node for out-of-band queries
    #[arg(long)]
    oob_host: Option<String>,

    #[arg(long, default_value_t = DEFAULT_OOB_PORT)]
    oob_port: u16,

    /// CA bundle; enables TLS for out-of-band queries
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Per-attempt timeout in milliseconds
    #[arg(short, long, allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Resends after a timeout
    #[arg(short, long, allow_negative_numbers = true)]
    retries: Option<i32>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Local port addressing and service states
    PortInfo,
    /// SA ClassPortInfo
    SaCpi,
    /// Node records
    Nodes {
        #[arg(long)]
        lid: Option<u32>,
        #[arg(long, value_parser = parse_u64)]
        port_guid: Option<u64>,
        #[arg(long, value_parser = parse_u64)]
        node_guid: Option<u64>,
        /// fi or sw
        #[arg(long)]
        node_type: Option<String>,
        #[arg(long)]
        desc: Option<String>,
    },
    /// Service records
    Services {
        #[arg(long, value_parser = parse_u64)]
        service_id: Option<u64>,
    },
    /// PA group names
    PaGroups,
    /// Counters of one port
    PaCounters {
        #[arg(long)]
        lid: u32,
        #[arg(long)]
        port_num: u8,
        #[arg(long)]
        delta: bool,
        #[arg(long)]
        user: bool,
        /// Frozen image id, 0 for the live image
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        image: u64,
    },
    /// Sweep image summary
    PaImageInfo {
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        image: u64,
    },
    /// Freeze the live image and print the frozen image id
    PaFreeze,
    /// Utilization summary of a group
    PaGroupInfo {
        #[arg(long, default_value = "All")]
        group: String,
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        image: u64,
    },
    /// Performance manager configuration
    PaPmConfig,
    /// Ports of a group ranked by a focus metric
    PaFocus {
        #[arg(long, default_value = "All")]
        group: String,
        /// util-high, util-low, util-pkts-high, integrity or congestion
        #[arg(long, default_value = "util-high", value_parser = parse_focus_select)]
        select: u32,
        #[arg(long, default_value_t = 0)]
        start: u32,
        #[arg(long, default_value_t = 10)]
        range: u32,
        #[arg(long, default_value_t = 0, value_parser = parse_u64)]
        image: u64,
    },
}

fn parse_focus_select(text: &str) -> Result<u32, String> {
    match text {
        "util-high" => Ok(FOCUS_SELECT_UTIL_HIGH),
        "util-low" => Ok(FOCUS_SELECT_UTIL_LOW),
        "util-pkts-high" => Ok(FOCUS_SELECT_UTIL_PKTS_HIGH),
        "integrity" => Ok(FOCUS_SELECT_INTEGRITY),
        "congestion" => Ok(FOCUS_SELECT_CONGESTION),
        _ => Err(format!("unknown focus metric '{}'", text)),
    }
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", text, e))
}

fn image_id(number: u64) -> ImageId {
    if number == 0 {
        ImageId::CURRENT
    } else {
        ImageId::frozen(number)
    }
}

impl Args {
    fn engine_config(&self) -> anyhow::Result<MadEngineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                MadEngineConfig::from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?
            }
            None => MadEngineConfig::default(),
        };

        if let Some(host) = &self.oob_host {
            config.mode = SessionMode::Oob {
                host: host.clone(),
                port: self.oob_port,
            };
        } else if self.device.is_some() || self.hfi != 0 || self.port != 0 {
            config.mode = SessionMode::Native {
                device: self.device.clone(),
                hfi: self.hfi,
                port: self.port,
            };
        }
        if let Some(ca_file) = &self.tls_ca {
            config.tls = Some(TlsConfig {
                ca_file: Some(ca_file.clone()),
                cert_file: self.tls_cert.clone(),
                key_file: self.tls_key.clone(),
                server_name: None,
            });
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = if timeout <= 0 { 0 } else { timeout as u64 };
        }
        if let Some(retries) = self.retries {
            config.retry_count = retries.max(0) as u32;
        }
        Ok(config)
    }
}

fn node_query(
    lid: Option<u32>,
    port_guid: Option<u64>,
    node_guid: Option<u64>,
    node_type: Option<&str>,
    desc: Option<&str>,
) -> anyhow::Result<NodeQuery> {
    Ok(match (lid, port_guid, node_guid, node_type, desc) {
        (Some(lid), ..) => NodeQuery::Lid(lid),
        (_, Some(guid), ..) => NodeQuery::PortGuid(guid),
        (_, _, Some(guid), ..) => NodeQuery::NodeGuid(guid),
        (_, _, _, Some(kind), _) => match kind {
            "fi" => NodeQuery::NodeType(NODE_TYPE_FI),
            "sw" => NodeQuery::NodeType(NODE_TYPE_SWITCH),
            other => anyhow::bail!("unknown node type {:?} (expected fi or sw)", other),
        },
        (_, _, _, _, Some(desc)) => NodeQuery::NodeDesc(desc.to_string()),
        _ => NodeQuery::All,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct PortInfo {
    port: mad_engine::umad::PortAttributes,
    sa_state: mad_engine::ServiceState,
    pa_state: mad_engine::ServiceState,
}

fn run(args: &Args, session: &mut Session) -> anyhow::Result<()> {
    match &args.command {
        Command::PortInfo => {
            let info = PortInfo {
                port: session.port_attributes()?,
                sa_state: session.sa_service_state(RefreshMode::RefreshIfBad)?,
                pa_state: session.pa_service_state(RefreshMode::RefreshIfBad)?,
            };
            if args.json {
                return print_json(&info);
            }
            let port = &info.port;
            println!("Device:   {} port {}", port.ca_name, port.port_num);
            println!("State:    {:?}", port.state);
            println!("LID:      0x{:x} (LMC {})", port.base_lid, port.lmc);
            println!("SM LID:   0x{:x} SL {}", port.sm_lid, port.sm_sl);
            println!("GID:      0x{:016x}:0x{:016x}", port.gid_prefix, port.port_guid);
            let keys: Vec<String> = port.pkeys.iter().map(|k| format!("0x{:04x}", k)).collect();
            println!("PKeys:    {}", keys.join(" "));
            println!("SA:       {:?}", info.sa_state);
            println!("PA:       {:?}", info.pa_state);
        }
        Command::SaCpi => {
            let cpi = session.sa_class_port_info()?;
            if args.json {
                return print_json(&cpi);
            }
            println!("Base version:  0x{:02x}", cpi.base_version);
            println!("Class version: 0x{:02x}", cpi.class_version);
            println!("Capabilities:  0x{:04x} / 0x{:08x}", cpi.cap_mask, cpi.cap_mask2);
            println!("Resp time:     {}", cpi.resp_time_value);
            println!("Redirect LID:  0x{:x}", cpi.redirect_lid);
            println!("Trap LID:      0x{:x}", cpi.trap_lid);
        }
        Command::Nodes {
            lid,
            port_guid,
            node_guid,
            node_type,
            desc,
        } => {
            let query = node_query(*lid, *port_guid, *node_guid, node_type.as_deref(), desc.as_deref())?;
            let nodes = session.sa_node_records(&query)?;
            if args.json {
                return print_json(&nodes);
            }
            println!("{:<10} {:<4} {:<18} {:<18} {}", "LID", "TYPE", "NODE GUID", "PORT GUID", "DESCRIPTION");
            for node in &nodes {
                let kind = match node.node_type {
                    NODE_TYPE_FI => "FI",
                    NODE_TYPE_SWITCH => "SW",
                    _ => "?",
                };
                println!(
                    "0x{:<8x} {:<4} 0x{:016x} 0x{:016x} {}",
                    node.lid, kind, node.node_guid, node.port_guid, node.node_desc
                );
            }
            println!("{} record(s)", nodes.len());
        }
        Command::Services { service_id } => {
            let query = service_id.map_or(ServiceQuery::All, ServiceQuery::ServiceId);
            let services = session.sa_service_records(&query)?;
            if args.json {
                return print_json(&services);
            }
            for service in &services {
                println!(
                    "0x{:016x} LID 0x{:x} GID {} {}",
                    service.service_id, service.service_lid, service.service_gid, service.service_name
                );
            }
            println!("{} record(s)", services.len());
        }
        Command::PaGroups => {
            let groups = session.pa_group_list()?;
            if args.json {
                return print_json(&groups);
            }
            for group in &groups {
                println!("{}", group);
            }
        }
        Command::PaCounters {
            lid,
            port_num,
            delta,
            user,
            image,
        } => {
            let counters = session.pa_port_counters(*lid, *port_num, *delta, *user, image_id(*image))?;
            if args.json {
                return print_json(&counters);
            }
            println!("LID 0x{:x} port {} (image {})", counters.node_lid, counters.port_number, counters.image_id.number);
            println!("  Xmit data:     {}", counters.port_xmit_data);
            println!("  Rcv data:      {}", counters.port_rcv_data);
            println!("  Xmit pkts:     {}", counters.port_xmit_pkts);
            println!("  Rcv pkts:      {}", counters.port_rcv_pkts);
            println!("  Rcv errors:    {}", counters.port_rcv_errors);
            println!("  Xmit discards: {}", counters.port_xmit_discards);
            println!("  Xmit wait:     {}", counters.port_xmit_wait);
            println!("  Link downed:   {}", counters.link_downed);
        }
        Command::PaImageInfo { image } => {
            let info = session.pa_image_info(image_id(*image))?;
            if args.json {
                return print_json(&info);
            }
            println!("Image:        {}", info.image_id.number);
            println!("Sweep start:  {}", info.sweep_start);
            println!("HFI ports:    {}", info.num_hfi_ports);
            println!("Switches:     {} ({} ports)", info.num_switch_nodes, info.num_switch_ports);
            println!("Links:        {}", info.num_links);
            println!("SMs:          {}", info.num_sms);
            for sm in info.sm_info.iter().filter(|sm| sm.lid != 0) {
                println!("  SM LID 0x{:x} priority {} {}", sm.lid, sm.priority, sm.node_desc);
            }
        }
        Command::PaFreeze => {
            let frozen = session.pa_freeze_image(ImageId::CURRENT)?;
            if args.json {
                return print_json(&frozen);
            }
            println!("Frozen image {}", frozen.number);
        }
        Command::PaGroupInfo { group, image } => {
            let infos = session.pa_group_info(group, image_id(*image))?;
            if args.json {
                return print_json(&infos);
            }
            for info in &infos {
                let util = &info.internal_util;
                println!("Group {} (image {})", info.group_name, info.image_id.number);
                println!("  Internal ports: {}", info.num_internal_ports);
                println!("  External ports: {}", info.num_external_ports);
                println!("  Total MB/s:     {}", util.total_mbps);
                println!("  Avg/min/max:    {}/{}/{} MB/s", util.avg_mbps, util.min_mbps, util.max_mbps);
            }
        }
        Command::PaPmConfig => {
            let config = session.pa_pm_config()?;
            if args.json {
                return print_json(&config);
            }
            println!("Sweep interval: {} s", config.sweep_interval);
            println!("Max clients:    {}", config.max_clients);
            println!("History/freeze: {}/{}", config.size_history, config.size_freeze);
            println!("Lease:          {} s", config.lease);
        }
        Command::PaFocus {
            group,
            select,
            start,
            range,
            image,
        } => {
            let focus = FocusSelect {
                select: *select,
                start: *start,
                range: *range,
            };
            let ports = session.pa_group_focus(group, image_id(*image), focus)?;
            if args.json {
                return print_json(&ports);
            }
            for port in &ports {
                println!("LID 0x{:x} port {:>3} {:>14} {}", port.node_lid, port.port_number, port.value, port.node_desc);
            }
            println!("{} port(s)", ports.len());
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = args.engine_config()?;
    debug!("Session configuration: {:?}", config);

    let mut session = Session::open(&config).context("failed to open session")?;
    let result = run(&args, &mut session);
    session.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from([
            "mad-query",
            "--device",
            "hfi1_0",
            "--port",
            "1",
            "--debug",
            "nodes",
            "--node-type",
            "sw",
        ])
        .unwrap();

        assert_eq!(args.device.as_deref(), Some("hfi1_0"));
        assert_eq!(args.port, 1);
        assert!(args.debug);
        assert!(matches!(args.command, Command::Nodes { .. }));
    }

    #[test]
    fn test_oob_config_from_args() {
        let args = Args::try_parse_from([
            "mad-query",
            "--oob-host",
            "fabric-mgr",
            "--tls-ca",
            "/etc/opa/ca.pem",
            "--timeout",
            "-5",
            "--retries",
            "1",
            "pa-counters",
            "--lid",
            "2",
            "--port-num",
            "5",
            "--image",
            "0x10",
        ])
        .unwrap();

        let config = args.engine_config().unwrap();
        assert_eq!(
            config.mode,
            SessionMode::Oob {
                host: "fabric-mgr".to_string(),
                port: DEFAULT_OOB_PORT
            }
        );
        assert!(config.tls.is_some());
        assert_eq!(config.timeout_ms, 0);
        assert_eq!(config.retry_count, 1);
        assert!(matches!(args.command, Command::PaCounters { image: 0x10, .. }));
    }

    #[test]
    fn test_focus_args() {
        let args = Args::try_parse_from(["mad-query", "pa-focus", "--select", "congestion", "--range", "5"]).unwrap();
        assert_eq!(
            args.command,
            Command::PaFocus {
                group: "All".to_string(),
                select: FOCUS_SELECT_CONGESTION,
                start: 0,
                range: 5,
                image: 0,
            }
        );
        assert!(Args::try_parse_from(["mad-query", "pa-focus", "--select", "hottest"]).is_err());
    }

    #[test]
    fn test_client_cert_needs_key() {
        assert!(Args::try_parse_from(["mad-query", "--tls-cert", "c.pem", "pa-groups"]).is_err());
    }

    #[test]
    fn test_node_query_selection() {
        assert_eq!(node_query(None, None, None, None, None).unwrap(), NodeQuery::All);
        assert_eq!(node_query(Some(3), None, None, Some("sw"), None).unwrap(), NodeQuery::Lid(3));
        assert_eq!(
            node_query(None, None, None, Some("fi"), None).unwrap(),
            NodeQuery::NodeType(NODE_TYPE_FI)
        );
        assert!(node_query(None, None, None, Some("router"), None).is_err());
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64("0x1100d03c34845555").unwrap(), 0x1100_d03c_3484_5555);
        assert_eq!(parse_u64("42").unwrap(), 42);
        assert!(parse_u64("zz").is_err());
    }
}
