//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use holo_fib::config::Config;
use holo_fib::dplane::{Context, DplaneOp, KernelOps};
use holo_fib::error::Error;
use holo_fib::rib::Route;
use holo_fib::southbound::{
    AddressFlags, AddressMsg, InterfaceFlags, InterfaceUpdateMsg, Nexthop,
    NexthopAddr, Protocol, RouteKeyMsg, RouteMsg, VRF_DEFAULT,
};
use holo_fib::{FibMsg, Master};
use ipnetwork::IpNetwork;

// Kernel operation seen by the mock kernel.
#[derive(Clone, Debug)]
pub struct KernelCall {
    pub op: DplaneOp,
    pub seq: u32,
    pub dest: Option<IpNetwork>,
    pub nhe_id: Option<u32>,
}

// Kernel stand-in recording every operation it is asked to perform.
#[derive(Clone, Debug, Default)]
pub struct MockKernel {
    calls: Arc<Mutex<Vec<KernelCall>>>,
    failing: Arc<Mutex<Vec<DplaneOp>>>,
}

// FIB instance driven synchronously by the test.
pub struct TestFib {
    pub master: Master,
    pub kernel: MockKernel,
    pub results_rx: Receiver<Vec<Context>>,
}

// ===== impl MockKernel =====

impl MockKernel {
    // Makes every subsequent operation of the given kind fail.
    pub fn fail(&self, op: DplaneOp) {
        self.failing.lock().unwrap().push(op);
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: DplaneOp) -> usize {
        self.calls().iter().filter(|call| call.op == op).count()
    }

    pub fn route_count(&self, op: DplaneOp, dest: &str) -> usize {
        let dest = net(dest);
        self.calls()
            .iter()
            .filter(|call| call.op == op && call.dest == Some(dest))
            .count()
    }

    pub fn nhe_count(&self, op: DplaneOp, nhe_id: u32) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.op == op && call.nhe_id == Some(nhe_id))
            .count()
    }

    fn record(&self, ctx: &Context) -> Result<(), Error> {
        self.calls.lock().unwrap().push(KernelCall {
            op: ctx.op(),
            seq: ctx.seq(),
            dest: ctx.route().map(|info| info.dest),
            nhe_id: ctx.nexthop_group().map(|info| info.id),
        });
        if self.failing.lock().unwrap().contains(&ctx.op()) {
            return Err(Error::KernelError(
                ctx.op(),
                "injected failure".to_owned(),
            ));
        }
        Ok(())
    }
}

impl KernelOps for MockKernel {
    fn route_update(&mut self, ctx: &Context) -> Result<(), Error> {
        self.record(ctx)
    }

    fn nexthop_update(&mut self, ctx: &Context) -> Result<(), Error> {
        self.record(ctx)
    }

    fn lsp_update(&mut self, ctx: &Context) -> Result<(), Error> {
        self.record(ctx)
    }

    fn pw_update(&mut self, ctx: &Context) -> Result<(), Error> {
        self.record(ctx)
    }
}

// ===== impl TestFib =====

impl TestFib {
    pub fn new(config: Config) -> TestFib {
        let kernel = MockKernel::default();
        let mut master = Master::new(config, Box::new(kernel.clone()));
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        master
            .start(move |results| {
                let _ = results_tx.send(results);
            })
            .unwrap();

        TestFib {
            master,
            kernel,
            results_rx,
        }
    }

    // Processes the message and waits for all resulting work to complete.
    pub fn send(&mut self, msg: FibMsg) {
        self.master.process_msg(msg);
        self.settle();
    }

    // Runs the RIB and the result loop until nothing is left in flight.
    pub fn settle(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            self.master.process_rib_update_queue();
            match self.results_rx.recv_timeout(Duration::from_millis(20)) {
                Ok(results) => self.master.process_dplane_results(results),
                Err(RecvTimeoutError::Timeout) => {
                    if self.master.dplane.queue_len() == 0
                        && self.master.rib.ip_update_queue.is_empty()
                        && self.master.rib.mpls_update_queue.is_empty()
                    {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            assert!(Instant::now() < deadline, "FIB did not settle");
        }
    }

    pub fn try_route(
        &self,
        protocol: Protocol,
        prefix: &str,
    ) -> Option<&Route> {
        self.master
            .rib
            .get(VRF_DEFAULT, &net(prefix))
            .and_then(|node| node.get(&protocol))
    }

    pub fn route(&self, protocol: Protocol, prefix: &str) -> &Route {
        self.try_route(protocol, prefix)
            .unwrap_or_else(|| panic!("missing {} route {}", protocol, prefix))
    }

    // Brings up eth0 (ifindex 1) with address 10.0.1.1/24.
    pub fn connect_eth0(&mut self) {
        self.send(interface_up("eth0", 1));
        self.send(address_add("eth0", "10.0.1.1/24"));
    }
}

// ===== global functions =====

pub fn net(prefix: &str) -> IpNetwork {
    prefix.parse().unwrap()
}

pub fn addr(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

pub fn gateway(addr: &str) -> Nexthop {
    Nexthop::new(NexthopAddr::Gateway(self::addr(addr)), VRF_DEFAULT)
}

pub fn interface_up(ifname: &str, ifindex: u32) -> FibMsg {
    FibMsg::InterfaceUpd(InterfaceUpdateMsg {
        ifname: ifname.to_owned(),
        ifindex,
        mtu: 1500,
        flags: InterfaceFlags::OPERATIVE,
    })
}

pub fn interface_down(ifname: &str, ifindex: u32) -> FibMsg {
    FibMsg::InterfaceUpd(InterfaceUpdateMsg {
        ifname: ifname.to_owned(),
        ifindex,
        mtu: 1500,
        flags: InterfaceFlags::empty(),
    })
}

pub fn address_add(ifname: &str, addr: &str) -> FibMsg {
    FibMsg::AddressAdd(AddressMsg {
        ifname: ifname.to_owned(),
        addr: net(addr),
        flags: AddressFlags::empty(),
    })
}

pub fn route_add(
    protocol: Protocol,
    prefix: &str,
    nexthops: Vec<Nexthop>,
) -> FibMsg {
    let distance = match protocol {
        Protocol::STATIC => 1,
        Protocol::BGP => 20,
        Protocol::OSPFV2 => 110,
        _ => 0,
    };
    FibMsg::RouteIpAdd(RouteMsg {
        protocol,
        vrf_id: VRF_DEFAULT,
        table_id: 254,
        prefix: net(prefix),
        distance,
        metric: 0,
        tag: None,
        instance: 0,
        mtu: 0,
        nexthops,
    })
}

pub fn route_del(protocol: Protocol, prefix: &str) -> FibMsg {
    FibMsg::RouteIpDel(RouteKeyMsg::new(protocol, VRF_DEFAULT, net(prefix)))
}
