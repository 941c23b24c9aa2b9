use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, name = "ironzone")]
pub struct Args {
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1")]
    pub host: IpAddr,
    #[arg(short('p'), long, value_name = "PORT", default_value_t = 53)]
    pub port: u16,
    #[arg(long, value_name = "PATH", default_value = "ironzone.db")]
    pub db_path: PathBuf,
    /// Addresses allowed to transfer zones: exact IPs, CIDR blocks or
    /// prefix wildcards ("192.168.*"), comma-separated
    #[arg(long, value_name = "ACL", value_delimiter = ',')]
    pub allow_transfer: Vec<String>,
    /// How often slave zones are checked against their masters
    #[arg(long, value_name = "SECONDS", default_value_t = 300)]
    pub check_interval: u64,
    /// Refuse transfer requests that are not TSIG-signed
    #[arg(long, default_value_t = false)]
    pub require_tsig: bool,
    /// Abort inbound transfers that grow beyond this many bytes
    #[arg(long, value_name = "BYTES", default_value_t = crate::DEFAULT_MAX_INBOUND_TRANSFER_SIZE)]
    pub max_inbound_transfer_size: usize,
    /// How many workers accept incoming requests in parallel
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub max_parallel_connections: usize,
    /// Disable the periodic slave zone maintenance loop
    #[arg(long, default_value_t = false)]
    pub disable_scheduler: bool,
}
