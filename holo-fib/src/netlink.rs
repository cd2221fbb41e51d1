//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use capctl::caps::CapState;
use ipnetwork::IpNetwork;
use netlink_packet_route::route::{RouteMessage, RouteProtocol};
use rtnetlink::{Handle, RouteMessageBuilder, new_connection};
use tracing::error;

use crate::dplane::{Context, DplaneOp, KernelOps, RouteInfo};
use crate::error::Error;
use crate::southbound::{Nexthop, NexthopAddr, Protocol};

// Kernel programming through rtnetlink.
pub struct NetlinkKernel {
    handle: Handle,
}

// ===== impl NetlinkKernel =====

impl NetlinkKernel {
    pub fn new() -> Result<NetlinkKernel, Error> {
        let handle = init()?;
        Ok(NetlinkKernel { handle })
    }
}

impl KernelOps for NetlinkKernel {
    fn route_update(&mut self, ctx: &Context) -> Result<(), Error> {
        let Some(info) = ctx.route() else {
            return Ok(());
        };
        let msg = route_message(info);
        let result = match ctx.op() {
            DplaneOp::RouteInstall | DplaneOp::RouteUpdate => {
                let request = self.handle.route().add(msg).replace();
                futures::executor::block_on(request.execute())
            }
            _ => {
                let request = self.handle.route().del(msg);
                futures::executor::block_on(request.execute())
            }
        };

        result.map_err(|error| Error::KernelError(ctx.op(), error.to_string()))
    }

    fn nexthop_update(&mut self, _ctx: &Context) -> Result<(), Error> {
        // TODO: not supported by the `rtnetlink` crate yet.
        Ok(())
    }

    fn lsp_update(&mut self, _ctx: &Context) -> Result<(), Error> {
        // TODO: not supported by the `rtnetlink` crate yet.
        Ok(())
    }

    fn pw_update(&mut self, _ctx: &Context) -> Result<(), Error> {
        // TODO: not supported by the `rtnetlink` crate yet.
        Ok(())
    }
}

// ===== helper functions =====

fn netlink_protocol(protocol: Protocol) -> RouteProtocol {
    match protocol {
        Protocol::BGP => RouteProtocol::Bgp,
        Protocol::ISIS => RouteProtocol::Isis,
        Protocol::OSPFV2 | Protocol::OSPFV3 => RouteProtocol::Ospf,
        Protocol::RIPV2 | Protocol::RIPNG => RouteProtocol::Rip,
        Protocol::STATIC => RouteProtocol::Static,
        _ => RouteProtocol::Unspec,
    }
}

fn route_message(info: &RouteInfo) -> RouteMessage {
    let protocol = netlink_protocol(info.protocol);

    // Recursive nexthops are programmed through their resolved children.
    let nexthop = info
        .nexthops
        .iter()
        .filter(|nexthop| nexthop.is_active())
        .flat_map(|nexthop| {
            if nexthop.is_recursive() {
                nexthop.resolved.iter().collect::<Vec<_>>()
            } else {
                vec![nexthop]
            }
        })
        .next();

    // TODO: install all nexthops once multipath is supported here.
    match info.dest {
        IpNetwork::V4(prefix) => {
            let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(prefix.ip(), prefix.prefix())
                .protocol(protocol);
            if let Some(nexthop) = nexthop {
                builder = add_nexthop_ipv4(builder, nexthop);
            }
            builder.build()
        }
        IpNetwork::V6(prefix) => {
            let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                .destination_prefix(prefix.ip(), prefix.prefix())
                .protocol(protocol);
            if let Some(nexthop) = nexthop {
                builder = add_nexthop_ipv6(builder, nexthop);
            }
            builder.build()
        }
    }
}

fn add_nexthop_ipv4(
    mut builder: RouteMessageBuilder<Ipv4Addr>,
    nexthop: &Nexthop,
) -> RouteMessageBuilder<Ipv4Addr> {
    match nexthop.addr {
        NexthopAddr::Gateway(addr) | NexthopAddr::GatewayIfindex(addr, _) => {
            if let IpAddr::V4(addr) = addr {
                builder = builder.gateway(addr);
            }
        }
        NexthopAddr::Interface(_) => (),
        NexthopAddr::Special(_) => {
            // TODO: not supported by the `rtnetlink` crate yet.
        }
    }
    if let Some(ifindex) = nexthop.output_ifindex() {
        builder = builder.output_interface(ifindex);
    }

    builder
}

fn add_nexthop_ipv6(
    mut builder: RouteMessageBuilder<Ipv6Addr>,
    nexthop: &Nexthop,
) -> RouteMessageBuilder<Ipv6Addr> {
    match nexthop.addr {
        NexthopAddr::Gateway(addr) | NexthopAddr::GatewayIfindex(addr, _) => {
            if let IpAddr::V6(addr) = addr {
                builder = builder.gateway(addr);
            }
        }
        NexthopAddr::Interface(_) => (),
        NexthopAddr::Special(_) => {
            // TODO: not supported by the `rtnetlink` crate yet.
        }
    }
    if let Some(ifindex) = nexthop.output_ifindex() {
        builder = builder.output_interface(ifindex);
    }

    builder
}

fn init() -> Result<Handle, Error> {
    // Create netlink connection.
    let (conn, handle, _) =
        new_connection().map_err(Error::NetlinkInitError)?;

    // Spawn the netlink connection on a separate thread with permanent elevated
    // capabilities.
    std::thread::Builder::new()
        .name("netlink".to_owned())
        .spawn(|| {
            // Raise capabilities.
            match CapState::get_current() {
                Ok(mut caps) => {
                    caps.effective = caps.permitted;
                    if let Err(error) = caps.set_current() {
                        error!(
                            "failed to update current capabilities: {}",
                            error
                        );
                    }
                }
                Err(error) => {
                    error!("failed to get current capabilities: {}", error);
                }
            }

            // Serve requests initiated by the netlink handle.
            futures::executor::block_on(conn)
        })
        .map_err(Error::ThreadSpawnError)?;

    // Return handle used to send netlink requests to the kernel.
    Ok(handle)
}
