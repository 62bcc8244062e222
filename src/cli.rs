use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "purple-aqi",
    version,
    about = "PurpleAir PM2.5 poller with EPA correction and AQI"
)]
pub struct Args {
    /// Run a single polling cycle, print the outcome as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Fetch one reading from this host and print it, bypassing the cascade.
    #[arg(long)]
    pub probe_host: Option<String>,
    #[arg(long, default_value_t = 80, requires = "probe_host")]
    pub probe_port: u16,
    #[arg(long, default_value_t = 15, requires = "probe_host")]
    pub probe_timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_flags_parse() {
        let args = Args::try_parse_from([
            "purple-aqi",
            "--probe-host",
            "purple-air.local",
            "--probe-port",
            "8000",
        ])
        .unwrap();
        assert_eq!(args.probe_host.as_deref(), Some("purple-air.local"));
        assert_eq!(args.probe_port, 8000);
        assert_eq!(args.probe_timeout_secs, 15);
        assert!(!args.once);
    }

    #[test]
    fn probe_port_requires_a_host() {
        assert!(Args::try_parse_from(["purple-aqi", "--probe-port", "8000"]).is_err());
    }
}
