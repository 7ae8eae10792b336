//! Suffix passthrough: configured zones bypass DoH entirely and are
//! answered by a bootstrap resolver over plain UDP or TCP. Typical use is a
//! corporate or home zone that only an internal resolver knows.

use crate::bail;
use crate::client::Transport;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Punycodes, lowercases and dot-brackets the configured suffixes once at
/// startup. `"Corp.Example"` becomes `".corp.example."`.
pub(crate) fn normalise_suffixes(suffixes: &[String]) -> Vec<String> {
    suffixes
        .iter()
        .filter_map(|suffix| match idna::domain_to_ascii(suffix) {
            Ok(ascii) => {
                let trimmed = ascii.to_lowercase();
                let trimmed = trimmed.trim_matches('.');
                if trimmed.is_empty() {
                    None
                } else {
                    Some(format!(".{}.", trimmed))
                }
            }
            Err(e) => {
                log::warn!("ignoring invalid passthrough suffix {:?}: {:?}", suffix, e);
                None
            }
        })
        .collect()
}

/// True when the question name falls under one of the normalised suffixes.
pub(crate) fn matches(suffixes: &[String], name: &str) -> bool {
    if suffixes.is_empty() {
        return false;
    }

    let mut ascii = match idna::domain_to_ascii(name) {
        Ok(ascii) => ascii.to_lowercase(),
        Err(_) => return false,
    };
    if !ascii.ends_with('.') {
        ascii.push('.');
    }
    let bracketed = format!(".{}", ascii.trim_start_matches('.'));

    suffixes
        .iter()
        .any(|suffix| bracketed.ends_with(suffix.as_str()))
}

/// Forwards the raw query to a random bootstrap resolver, matching the
/// inbound transport, and returns the raw reply.
pub(crate) async fn forward(
    bootstrap: &[SocketAddr],
    packet: &[u8],
    transport: Transport,
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    if bootstrap.is_empty() {
        bail!(
            NotFound,
            "a passthrough suffix matched but no bootstrap resolvers are configured"
        );
    }

    let server = bootstrap[rand::thread_rng().gen_range(0..bootstrap.len())];

    let exchange = async {
        match transport {
            Transport::Udp => {
                let local: SocketAddr = if server.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ("[::]:0".parse::<SocketAddr>()).unwrap()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(server).await?;
                socket.send(packet).await?;

                let mut buf = vec![0; 4096];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                Ok(buf)
            }
            Transport::Tcp => {
                let mut stream = TcpStream::connect(server).await?;
                stream.set_nodelay(true)?;

                // Two byte length prefix followed by the message.
                stream.write_all(&(packet.len() as u16).to_be_bytes()).await?;
                stream.write_all(packet).await?;

                let mut len = [0; 2];
                stream.read_exact(&mut len).await?;
                let mut buf = vec![0; u16::from_be_bytes(len).into()];
                stream.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_elapsed) => bail!(TimedOut, "passthrough resolver {} timed out", server),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_normalisation() {
        let suffixes = normalise_suffixes(&[
            "Corp.Example.COM".to_string(),
            "home.arpa.".to_string(),
            ".".to_string(),
        ]);

        assert_eq!(suffixes, vec![".corp.example.com.", ".home.arpa."]);
    }

    #[test]
    fn test_matching_is_suffix_only() {
        let suffixes = normalise_suffixes(&["corp.example.com".to_string()]);

        assert!(matches(&suffixes, "corp.example.com."));
        assert!(matches(&suffixes, "www.corp.example.com."));
        assert!(matches(&suffixes, "WWW.CORP.Example.com."));

        // Not a label boundary match.
        assert!(!matches(&suffixes, "evilcorp.example.com."));
        assert!(!matches(&suffixes, "example.com."));
        assert!(!matches(&suffixes, "notcorp.example.org."));
    }

    #[test]
    fn test_empty_suffix_list_never_matches() {
        assert!(!matches(&[], "example.com."));
    }
}
