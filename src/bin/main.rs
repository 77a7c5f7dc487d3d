use clap::{Parser, Subcommand};
use rperf3_runner::{
    describe_error, ClientConfig, ConnectRetry, EngineDefaults, NativeEngine, OutputHandle,
    Protocol, ResultCode, Runner, ServerConfig,
};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "rperf3-runner")]
#[command(about = "Run one iperf-style throughput test and print its JSON report", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a single test
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Interval for periodic samples in seconds (0 keeps the engine default)
        #[arg(short, long, default_value = "0")]
        interval: u64,
    },

    /// Run a test against a server
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Transport protocol (tcp, udp or sctp)
        #[arg(long, default_value = "tcp", conflicts_with = "udp")]
        protocol: Protocol,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds (0 keeps the engine default)
        #[arg(short = 't', long, default_value = "0")]
        time: u64,

        /// Number of bytes to send instead of a timed test
        #[arg(short = 'n', long, default_value = "0")]
        bytes: u64,

        /// Buffer size in bytes (0 keeps the engine default)
        #[arg(short = 'l', long, default_value = "0")]
        length: u64,

        /// Number of blocks to send instead of a timed test
        #[arg(short = 'k', long, default_value = "0")]
        blocks: u64,

        /// Target bandwidth in Mbps (for UDP)
        #[arg(short, long)]
        bandwidth: Option<u64>,

        /// Interval for periodic samples in seconds (0 keeps the engine default)
        #[arg(short, long, default_value = "0")]
        interval: u64,

        /// Give up after this many refused connections instead of waiting for the server
        #[arg(long)]
        retry_limit: Option<usize>,
    },
}

/// Converts Mbps to bps, capping absurd rates instead of overflowing.
fn mbps_to_bps(mbps: u64) -> u64 {
    mbps.saturating_mul(1_000_000)
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Server { port, interval } => {
            let config = ServerConfig::new(port).with_measurement_interval(interval);
            Runner::new(NativeEngine::default()).run_server(&config, OutputHandle::stdout())
        }

        Commands::Client {
            server,
            port,
            protocol,
            udp,
            time,
            bytes,
            length,
            blocks,
            bandwidth,
            interval,
            retry_limit,
        } => {
            let protocol = if udp { Protocol::Udp } else { protocol };
            let config = ClientConfig::new(server, port)
                .with_protocol(protocol)
                .with_duration(time)
                .with_bytes(bytes)
                .with_buffer_size(length)
                .with_packets(blocks)
                .with_measurement_interval(interval);

            let mut defaults = EngineDefaults::default();
            if let Some(bw) = bandwidth {
                defaults.udp_bandwidth = mbps_to_bps(bw);
            }
            let retry = retry_limit.map_or(ConnectRetry::Unbounded, ConnectRetry::Limited);

            Runner::new(NativeEngine::with_defaults(defaults))
                .with_connect_retry(retry)
                .run_client(&config, OutputHandle::stdout())
        }
    };

    if result.is_err() {
        eprintln!("rperf3-runner: {}", describe_error(&result));
    }
    // Raw result codes are small non-negative values.
    Ok(ExitCode::from(ResultCode::of(&result).as_raw() as u8))
}
