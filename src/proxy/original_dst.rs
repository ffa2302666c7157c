//! Original-destination lookup for transparently redirected connections.
//!
//! iptables/nftables REDIRECT rewrites the destination before the proxy
//! accepts; the kernel keeps the original in the `SO_ORIGINAL_DST` socket
//! option. Transparent mode is Linux-only.

use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Retrieve the original destination of a redirected connection.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> std::io::Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> std::io::Result<SocketAddr> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "transparent redirection requires SO_ORIGINAL_DST (Linux only)",
    ))
}
