use std::fmt;
use std::net::{
  IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6,
};

use crate::error::Error;

/// Address family of an [`Addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrFamily {
  V4,
  V6,
}

/// A socket endpoint: an IP address plus a port.
///
/// Thin value wrapper over [`SocketAddr`] with chainable setters and
/// conversions to and from the native sockaddr representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
  inner: SocketAddr,
}

impl Addr {
  /// `0.0.0.0:0`, the value of an endpoint nothing has filled in yet.
  pub const UNSPECIFIED: Addr = Addr {
    inner: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
  };

  /// `[::]:0`, the v6 counterpart of [`Addr::UNSPECIFIED`].
  pub const UNSPECIFIED_V6: Addr = Addr {
    inner: SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)),
  };

  pub fn new(ip: IpAddr, port: u16) -> Self {
    Self { inner: SocketAddr::new(ip, port) }
  }

  /// Parses an IP address literal (v4 or v6) and pairs it with `port`.
  ///
  /// Malformed text is an error, never a silently unchanged endpoint.
  pub fn parse(text: &str, port: u16) -> Result<Self, Error> {
    let ip: IpAddr = text
      .trim()
      .parse()
      .map_err(|_| Error::InvalidAddress(text.to_owned()))?;
    Ok(Self::new(ip, port))
  }

  pub fn ip(&self) -> IpAddr {
    self.inner.ip()
  }

  pub fn port(&self) -> u16 {
    self.inner.port()
  }

  pub fn family(&self) -> AddrFamily {
    match self.inner {
      SocketAddr::V4(_) => AddrFamily::V4,
      SocketAddr::V6(_) => AddrFamily::V6,
    }
  }

  pub fn with_port(mut self, port: u16) -> Self {
    self.inner.set_port(port);
    self
  }

  pub fn with_ip(mut self, ip: IpAddr) -> Self {
    self.inner.set_ip(ip);
    self
  }

  pub fn socket_addr(&self) -> SocketAddr {
    self.inner
  }
}

impl From<SocketAddr> for Addr {
  fn from(inner: SocketAddr) -> Self {
    Self { inner }
  }
}

impl From<Addr> for SocketAddr {
  fn from(addr: Addr) -> Self {
    addr.inner
  }
}

impl fmt::Display for Addr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.inner.fmt(f)
  }
}

#[cfg(unix)]
impl Addr {
  /// Native representation for bind/connect/sendto. Returns the storage
  /// by value; callers take a `sockaddr` pointer to it for the syscall.
  pub(crate) fn to_storage(self) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match self.inner {
      SocketAddr::V4(v4) => {
        let sin = libc::sockaddr_in {
          sin_family: libc::AF_INET as libc::sa_family_t,
          sin_port: v4.port().to_be(),
          // octets() are already network order, so reinterpret in place
          sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
          sin_zero: [0; 8],
        };
        unsafe {
          std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
        }
        (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
      }
      SocketAddr::V6(v6) => {
        let sin6 = libc::sockaddr_in6 {
          sin6_family: libc::AF_INET6 as libc::sa_family_t,
          sin6_port: v6.port().to_be(),
          sin6_flowinfo: v6.flowinfo(),
          sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
          sin6_scope_id: v6.scope_id(),
        };
        unsafe {
          std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
        }
        (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
      }
    }
  }

  pub(crate) fn from_storage(
    storage: &libc::sockaddr_storage,
  ) -> std::io::Result<Self> {
    match storage.ss_family as libc::c_int {
      libc::AF_INET => {
        let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
        let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
        Ok(Self {
          inner: SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))),
        })
      }
      libc::AF_INET6 => {
        let sin6 =
          unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
        let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
        Ok(Self {
          inner: SocketAddr::V6(SocketAddrV6::new(
            ip,
            u16::from_be(sin6.sin6_port),
            sin6.sin6_flowinfo,
            sin6.sin6_scope_id,
          )),
        })
      }
      other => Err(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("unsupported address family: {other}"),
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_v4_literal() {
    let addr = Addr::parse("127.0.0.1", 8080).unwrap();
    assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(addr.port(), 8080);
    assert_eq!(addr.family(), AddrFamily::V4);
  }

  #[test]
  fn parses_v6_literal() {
    let addr = Addr::parse("::1", 443).unwrap();
    assert_eq!(addr.family(), AddrFamily::V6);
    assert_eq!(addr.port(), 443);
  }

  #[test]
  fn trims_surrounding_whitespace() {
    let addr = Addr::parse("  10.0.0.1 ", 80).unwrap();
    assert_eq!(addr.to_string(), "10.0.0.1:80");
  }

  #[test]
  fn malformed_literal_is_an_error() {
    // Rejecting garbage outright; the endpoint is never left half-set.
    let err = Addr::parse("not-an-ip", 80).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(text) if text == "not-an-ip"));
    assert!(Addr::parse("256.1.1.1", 80).is_err());
    assert!(Addr::parse("", 80).is_err());
  }

  #[test]
  fn chainable_setters() {
    let addr = Addr::parse("127.0.0.1", 1).unwrap().with_port(9000);
    assert_eq!(addr.port(), 9000);
    let addr = addr.with_ip(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
    assert_eq!(addr.to_string(), "10.1.2.3:9000");
  }

  #[cfg(unix)]
  #[test]
  fn storage_round_trip_v4() {
    let addr = Addr::parse("192.168.1.7", 5555).unwrap();
    let (storage, len) = addr.to_storage();
    assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
    assert_eq!(Addr::from_storage(&storage).unwrap(), addr);
  }

  #[cfg(unix)]
  #[test]
  fn storage_round_trip_v6() {
    let addr = Addr::parse("fe80::1", 9999).unwrap();
    let (storage, len) = addr.to_storage();
    assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
    assert_eq!(Addr::from_storage(&storage).unwrap(), addr);
  }

  #[cfg(unix)]
  #[test]
  fn unknown_family_is_rejected() {
    let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    assert!(Addr::from_storage(&storage).is_err());
  }
}
