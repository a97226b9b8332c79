//! Raw `AF_NETLINK` socket setup.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem;

/// Build a netlink socket address for `port_id` with the given multicast
/// `groups` mask.
pub fn netlink_addr(port_id: u32, groups: u32) -> SockAddr {
    // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_nl,
    // and the zeroed storage is a valid value for both.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let addr = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_nl;
        (*addr).nl_family = libc::AF_NETLINK as libc::sa_family_t;
        (*addr).nl_pid = port_id;
        (*addr).nl_groups = groups;
        SockAddr::new(
            storage,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    }
}

/// Open a non-blocking netlink socket for `protocol_id` bound to `port_id`
/// without multicast membership.
///
/// A `port_id` of 0 lets the kernel assign one.
pub fn open(protocol_id: u32, port_id: u32) -> io::Result<Socket> {
    let protocol = i32::try_from(protocol_id).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("protocol id {protocol_id} out of range"),
        )
    })?;

    let socket = Socket::new(
        Domain::from(libc::AF_NETLINK),
        Type::RAW,
        Some(Protocol::from(protocol)),
    )?;

    socket.set_nonblocking(true)?;
    socket.bind(&netlink_addr(port_id, 0))?;

    Ok(socket)
}

/// Port id the kernel bound `socket` to.
pub fn local_port_id(socket: &Socket) -> io::Result<u32> {
    let addr = socket.local_addr()?;
    if addr.family() != libc::AF_NETLINK as libc::sa_family_t {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "socket is not a netlink socket",
        ));
    }

    // SAFETY: the family check guarantees the storage holds a sockaddr_nl.
    let nl = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_nl) };
    Ok(nl.nl_pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netlink_addr_layout() {
        let addr = netlink_addr(1234, 0);
        assert_eq!(addr.family(), libc::AF_NETLINK as libc::sa_family_t);
        assert_eq!(
            addr.len() as usize,
            mem::size_of::<libc::sockaddr_nl>()
        );

        let nl = unsafe { &*(addr.as_ptr() as *const libc::sockaddr_nl) };
        assert_eq!(nl.nl_pid, 1234);
        assert_eq!(nl.nl_groups, 0);
    }

    #[test]
    fn test_open_rejects_unknown_protocol() {
        // The kernel supports at most 32 netlink protocols.
        assert!(open(200, 0).is_err());
        assert!(open(u32::MAX, 0).is_err());
    }
}
