//! TOML configuration for the two proxy programs.
//!
//! Unknown keys are rejected so a typo fails loudly at startup instead of
//! silently disabling the option.

use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Selector names accepted by `upstream_selector`.
pub const SELECTOR_RANDOM: &str = "random";
pub const SELECTOR_NGINX_WRR: &str = "weighted_round_robin";
pub const SELECTOR_LVS_WRR: &str = "lvs_weighted_round_robin";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// One DoH upstream endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamDetail {
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub upstream_google: Vec<UpstreamDetail>,

    #[serde(default)]
    pub upstream_ietf: Vec<UpstreamDetail>,

    #[serde(default)]
    pub upstream_selector: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OthersConfig {
    /// Plain DNS resolvers (`ip` or `ip:port`) used to resolve the DoH
    /// endpoint hostnames and to serve passthrough suffixes.
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// DNS suffixes answered over plain DNS instead of DoH.
    #[serde(default)]
    pub passthrough: Vec<String>,

    /// Per-request deadline in seconds.
    #[serde(default)]
    pub timeout: u64,

    #[serde(default)]
    pub no_cookies: bool,

    #[serde(default)]
    pub no_ecs: bool,

    #[serde(default)]
    pub no_ipv6: bool,

    #[serde(default)]
    pub no_user_agent: bool,

    #[serde(default)]
    pub verbose: bool,

    /// HTTP response headers worth logging on every exchange.
    #[serde(default)]
    pub debug_http_headers: Vec<String>,
}

/// Configuration for the `doh-client` program.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Local `host:port` addresses serving classical DNS over UDP and TCP.
    #[serde(default)]
    pub listen: Vec<String>,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub others: OthersConfig,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
        let conf = fs::read_to_string(path)?;
        let mut conf: ClientConfig = toml::from_str(&conf)?;

        if conf.listen.is_empty() {
            conf.listen = vec!["127.0.0.1:53".to_string(), "[::1]:53".to_string()];
        }
        if conf.upstream.upstream_google.is_empty() && conf.upstream.upstream_ietf.is_empty() {
            conf.upstream.upstream_google = vec![UpstreamDetail {
                url: "https://dns.google.com/resolve".to_string(),
                weight: 50,
            }];
        }
        if conf.upstream.upstream_selector.is_empty() {
            conf.upstream.upstream_selector = SELECTOR_RANDOM.to_string();
        }
        if conf.others.timeout == 0 {
            conf.others.timeout = 10;
        }

        match conf.upstream.upstream_selector.as_str() {
            SELECTOR_RANDOM | SELECTOR_NGINX_WRR | SELECTOR_LVS_WRR => {}
            other => {
                return Err(invalid(format!(
                    "unknown upstream_selector {:?}, choose one of: {} {} {}",
                    other, SELECTOR_RANDOM, SELECTOR_NGINX_WRR, SELECTOR_LVS_WRR
                )))
            }
        }

        for upstream in conf
            .upstream
            .upstream_google
            .iter()
            .chain(conf.upstream.upstream_ietf.iter())
        {
            if upstream.weight < 1 {
                return Err(invalid(format!(
                    "upstream {:?} must have a weight of at least 1",
                    upstream.url
                )));
            }
        }

        // Fail on malformed bootstrap addresses now rather than per dial.
        parse_bootstrap(&conf.others.bootstrap)?;

        Ok(conf)
    }
}

/// Parses bootstrap resolver addresses, inferring port 53 when absent.
pub fn parse_bootstrap(bootstrap: &[String]) -> Result<Vec<SocketAddr>, ConfigError> {
    bootstrap
        .iter()
        .map(|addr| {
            if let Ok(addr) = SocketAddr::from_str(addr) {
                return Ok(addr);
            }
            if let Ok(ip) = IpAddr::from_str(addr) {
                return Ok(SocketAddr::new(ip, 53));
            }
            Err(invalid(format!("invalid bootstrap address {:?}", addr)))
        })
        .collect()
}

/// Configuration for the `doh-server` program.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Local `host:port` addresses serving HTTP(S).
    #[serde(default)]
    pub listen: Vec<String>,

    /// Optional local address to bind when dialing upstream resolvers.
    #[serde(default)]
    pub local_addr: String,

    /// TLS certificate chain and key, both or neither.
    #[serde(default)]
    pub cert: String,

    #[serde(default)]
    pub key: String,

    /// URL path of the DoH endpoint.
    #[serde(default)]
    pub path: String,

    /// Conventional resolvers as `udp:host:port`, `tcp:host:port` or
    /// `tcp-tls:host:port`.
    #[serde(default)]
    pub upstream: Vec<String>,

    /// Per-exchange deadline in seconds.
    #[serde(default)]
    pub timeout: u64,

    /// Attempts per query, each against a freshly picked upstream.
    #[serde(default)]
    pub tries: u32,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub log_guessed_client_ip: bool,

    /// HTTP request headers worth logging on every exchange.
    #[serde(default)]
    pub debug_http_headers: Vec<String>,

    /// Answer repeats of a question from memory while its TTL lasts.
    #[serde(default)]
    pub caching: bool,

    /// Forward the exact client address instead of a /24 or /56.
    #[serde(default)]
    pub ecs_use_precise_ip: bool,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
        let conf = fs::read_to_string(path)?;
        let mut conf: ServerConfig = toml::from_str(&conf)?;

        if conf.listen.is_empty() {
            conf.listen = vec!["127.0.0.1:8053".to_string(), "[::1]:8053".to_string()];
        }
        if conf.path.is_empty() {
            conf.path = "/dns-query".to_string();
        }
        if conf.upstream.is_empty() {
            conf.upstream = vec!["udp:8.8.8.8:53".to_string(), "udp:8.8.4.4:53".to_string()];
        }
        if conf.timeout == 0 {
            conf.timeout = 10;
        }
        if conf.tries == 0 {
            conf.tries = 1;
        }

        if conf.cert.is_empty() != conf.key.is_empty() {
            return Err(invalid(
                "you must specify both \"cert\" and \"key\" to enable TLS",
            ));
        }

        if !conf.local_addr.is_empty() && IpAddr::from_str(&conf.local_addr).is_err() {
            return Err(invalid(format!(
                "invalid local_addr {:?}",
                conf.local_addr
            )));
        }

        for upstream in &conf.upstream {
            match upstream.split_once(':') {
                Some(("udp", addr)) | Some(("tcp", addr)) | Some(("tcp-tls", addr)) => {
                    if addr.is_empty() {
                        return Err(invalid(format!("invalid upstream {:?}", upstream)));
                    }
                }
                _ => {
                    return Err(invalid(format!(
                        "upstream {:?} needs a (udp|tcp|tcp-tls) prefix, e.g. udp:1.1.1.1:53",
                        upstream
                    )))
                }
            }
        }

        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn load_client(toml: &str) -> Result<ClientConfig, ConfigError> {
        let mut file = tempfile();
        file.write_all(toml.as_bytes()).unwrap();
        ClientConfig::load(file.path())
    }

    fn load_server(toml: &str) -> Result<ServerConfig, ConfigError> {
        let mut file = tempfile();
        file.write_all(toml.as_bytes()).unwrap();
        ServerConfig::load(file.path())
    }

    struct TempPath(std::path::PathBuf, fs::File);

    impl TempPath {
        fn path(&self) -> &std::path::Path {
            &self.0
        }
    }

    impl Write for TempPath {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.1.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.1.flush()
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    fn tempfile() -> TempPath {
        let path = std::env::temp_dir().join(format!(
            "dohproxy-test-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        let file = fs::File::create(&path).unwrap();
        TempPath(path, file)
    }

    #[test]
    fn test_client_defaults() {
        let conf = load_client("").unwrap();

        assert_eq!(conf.listen, vec!["127.0.0.1:53", "[::1]:53"]);
        assert_eq!(conf.upstream.upstream_google.len(), 1);
        assert_eq!(conf.upstream.upstream_selector, SELECTOR_RANDOM);
        assert_eq!(conf.others.timeout, 10);
    }

    #[test]
    fn test_client_full() {
        let conf = load_client(
            r#"
            listen = ["127.0.0.1:5300"]

            [upstream]
            upstream_google = [{url = "https://dns.google.com/resolve", weight = 50}]
            upstream_ietf = [{url = "https://cloudflare-dns.com/dns-query", weight = 10}]
            upstream_selector = "weighted_round_robin"

            [others]
            bootstrap = ["8.8.8.8", "1.1.1.1:53"]
            passthrough = ["corp.example.com"]
            timeout = 5
            no_cookies = true
            no_ecs = true
            no_ipv6 = true
            no_user_agent = true
            verbose = true
            debug_http_headers = ["X-Served-By"]
            "#,
        )
        .unwrap();

        assert_eq!(conf.upstream.upstream_ietf[0].weight, 10);
        assert_eq!(conf.others.timeout, 5);
        assert!(conf.others.no_ecs);

        let bootstrap = parse_bootstrap(&conf.others.bootstrap).unwrap();
        assert_eq!(bootstrap[0], "8.8.8.8:53".parse().unwrap());
        assert_eq!(bootstrap[1], "1.1.1.1:53".parse().unwrap());
    }

    #[test]
    fn test_client_rejects_unknown_keys_and_bad_values() {
        assert!(load_client("unknown_key = true").is_err());
        assert!(load_client("[upstream]\nupstream_selector = \"mystery\"").is_err());
        assert!(load_client(
            "[upstream]\nupstream_google = [{url = \"https://example.com\", weight = 0}]"
        )
        .is_err());
        assert!(load_client("[others]\nbootstrap = [\"not-an-ip\"]").is_err());
    }

    #[test]
    fn test_server_defaults() {
        let conf = load_server("").unwrap();

        assert_eq!(conf.listen, vec!["127.0.0.1:8053", "[::1]:8053"]);
        assert_eq!(conf.path, "/dns-query");
        assert_eq!(conf.upstream, vec!["udp:8.8.8.8:53", "udp:8.8.4.4:53"]);
        assert_eq!(conf.timeout, 10);
        assert_eq!(conf.tries, 1);
        assert!(!conf.caching);
    }

    #[test]
    fn test_server_validation() {
        assert!(load_server("cert = \"only-half\"").is_err());
        assert!(load_server("upstream = [\"8.8.8.8:53\"]").is_err());
        assert!(load_server("upstream = [\"quic:8.8.8.8:53\"]").is_err());
        assert!(load_server("local_addr = \"not-an-ip\"").is_err());

        let conf = load_server("upstream = [\"tcp-tls:1.1.1.1:853\"]").unwrap();
        assert_eq!(conf.upstream, vec!["tcp-tls:1.1.1.1:853"]);
    }
}
