/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::error::IngestError;
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::Duration,
};
use tracing::{info, instrument};

/// Binds a UDP socket for the given multicast (or unicast) group/port,
/// joining the group on `local_ip` when the address is multicast.
#[instrument]
pub fn create_rx_socket(group: IpAddr, local_ip: IpAddr, port: u16) -> Result<UdpSocket, IngestError> {
    let socket = match (group, local_ip) {
        (IpAddr::V4(group), IpAddr::V4(local_ip)) => create_ipv4_rx_socket(group, local_ip, port)?,
        (IpAddr::V6(group), IpAddr::V6(local_ip)) => create_ipv6_rx_socket(group, local_ip, port)?,
        (IpAddr::V4(_), IpAddr::V6(_)) => {
            return Err(IngestError::Other(
                "cannot receive an IPv4 group when bound to a local IPv6 address".to_owned(),
            ));
        }
        (IpAddr::V6(_), IpAddr::V4(_)) => {
            return Err(IngestError::Other(
                "cannot receive an IPv6 group when bound to a local IPv4 address".to_owned(),
            ));
        }
    };
    Ok(socket.into())
}

#[instrument]
pub fn create_ipv4_rx_socket(group: Ipv4Addr, local_ip: Ipv4Addr, port: u16) -> Result<Socket, IngestError> {
    info!(
        "creating IPv4 {} rx socket for {}:{} at {}:{}",
        if group.is_multicast() { "multicast" } else { "unicast" },
        group,
        port,
        local_ip,
        port
    );

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(250)))?;

    if group.is_multicast() {
        socket.join_multicast_v4(&group, &local_ip)?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(group), port)))?;
    } else {
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V4(local_ip), port)))?;
    }
    Ok(socket)
}

#[instrument]
pub fn create_ipv6_rx_socket(group: Ipv6Addr, local_ip: Ipv6Addr, port: u16) -> Result<Socket, IngestError> {
    info!(
        "creating IPv6 {} rx socket for {}:{} at {}:{}",
        if group.is_multicast() { "multicast" } else { "unicast" },
        group,
        port,
        local_ip,
        port
    );

    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(250)))?;

    if group.is_multicast() {
        socket.join_multicast_v6(&group, 0)?;
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(group), port)))?;
    } else {
        socket.bind(&SockAddr::from(SocketAddr::new(IpAddr::V6(local_ip), port)))?;
    }
    Ok(socket)
}
