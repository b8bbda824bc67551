use std::{future::Future, io, net::SocketAddr};

use tokio::net::lookup_host;

/// Name resolution used by outbound streams.
pub trait Resolver: Clone + Send + Sync + 'static {
    /// Resolves `host` to at least one address, or fails with `NotFound`.
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;
}

/// Resolves through the operating system (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|err| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("failed to resolve {host}: {err}"),
                )
            })?
            .collect();

        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            ));
        }
        Ok(addrs)
    }
}

/// Parses a service (port number, or the `http`/`https` names) into a port.
pub(crate) fn parse_service(service: &str) -> io::Result<u16> {
    match service {
        "http" => Ok(80),
        "https" => Ok(443),
        port => port.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid service {port:?}"),
            )
        }),
    }
}
