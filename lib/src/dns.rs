use futures::Future;
use std::{io, net::IpAddr};
use tokio::sync::oneshot;

/// The address set a host resolved to.
///
/// `cur` is the rotation point: consumers walk the addresses starting there
/// and wrap around, so repeated resolutions of a multi-homed host spread load
/// across its addresses.
#[derive(Debug, Clone)]
pub struct ResolvedAddrs {
    pub cur: usize,
    pub addrs: Vec<IpAddr>,
}

impl ResolvedAddrs {
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self { cur: 0, addrs }
    }

    /// Walk all addresses in rotated order, beginning at `cur`.
    pub fn iter_rotated(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let n = self.addrs.len();
        (0..n).map(move |i| self.addrs[(self.cur + i) % n])
    }
}

/// An in-flight host lookup.
#[derive(Debug)]
pub struct DnsLookup {
    pub receiver: oneshot::Receiver<Result<ResolvedAddrs, io::Error>>,
}

impl DnsLookup {
    pub fn spawn(
        req: impl Future<Output = Result<ResolvedAddrs, io::Error>> + Send + 'static,
    ) -> Self {
        let (sender, receiver) = oneshot::channel();
        tokio::task::spawn(async move { sender.send(req.await) });
        Self { receiver }
    }

    /// A lookup whose result is already known.
    pub fn ready(result: Result<ResolvedAddrs, io::Error>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }

    pub async fn wait(self) -> Result<ResolvedAddrs, io::Error> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "lookup abandoned")))
    }
}

/// Host resolution seam consulted by the selection engine.
pub trait DnsResolver: Send + Sync {
    fn lookup(&self, host: &str) -> DnsLookup;
}

/// A [`DnsResolver`] backed by the operating system's resolver.
pub struct SystemResolver;

impl DnsResolver for SystemResolver {
    fn lookup(&self, host: &str) -> DnsLookup {
        let host = host.to_owned();
        DnsLookup::spawn(async move {
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await?
                .map(|sockaddr| sockaddr.ip())
                .collect();
            if addrs.is_empty() {
                Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", host),
                ))
            } else {
                Ok(ResolvedAddrs::new(addrs))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::from(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn rotation_wraps_around() {
        let mut ia = ResolvedAddrs::new(vec![ip(10, 0, 0, 1), ip(10, 0, 0, 2), ip(10, 0, 0, 3)]);
        ia.cur = 2;
        let walked: Vec<_> = ia.iter_rotated().collect();
        assert_eq!(walked, vec![ip(10, 0, 0, 3), ip(10, 0, 0, 1), ip(10, 0, 0, 2)]);
    }

    #[test]
    fn rotation_of_empty_set() {
        let ia = ResolvedAddrs::new(vec![]);
        assert_eq!(ia.iter_rotated().count(), 0);
    }

    #[tokio::test]
    async fn ready_lookup_resolves() {
        let lookup = DnsLookup::ready(Ok(ResolvedAddrs::new(vec![ip(127, 0, 0, 1)])));
        let ia = lookup.wait().await.expect("resolves");
        assert_eq!(ia.addrs, vec![ip(127, 0, 0, 1)]);
    }
}
