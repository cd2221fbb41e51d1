//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn};

use crate::dplane::DplaneOp;

// FIB errors.
#[derive(Debug)]
pub enum Error {
    // Dataplane pipeline
    DplaneStopped(DplaneOp),
    ProviderRegisterInvalid(String),
    ContextInitError(DplaneOp, &'static str),
    KernelError(DplaneOp, String),
    ThreadSpawnError(std::io::Error),
    NetlinkInitError(std::io::Error),
    // Nexthop group table
    NhgIdCollision(u32, u32),
    NhgContentMismatch(u32),
    NhgDependNotFound(u32, u32),
    NhgIdNotFound(u32),
    NhgRefcntUnderflow(u32),
    // Interfaces
    InterfaceNotFound(u32),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::DplaneStopped(op) => {
                warn!(%op, "{}", self);
            }
            Error::ProviderRegisterInvalid(name) => {
                warn!(%name, "{}", self);
            }
            Error::ContextInitError(op, reason) => {
                warn!(%op, %reason, "{}", self);
            }
            Error::KernelError(op, error) => {
                error!(%op, %error, "{}", self);
            }
            Error::ThreadSpawnError(error)
            | Error::NetlinkInitError(error) => {
                error!(%error, "{}", self);
            }
            Error::NhgIdCollision(id, existing_id) => {
                warn!(%id, %existing_id, "{}", self);
            }
            Error::NhgContentMismatch(id) => {
                warn!(%id, "{}", self);
            }
            Error::NhgDependNotFound(id, depend_id) => {
                warn!(%id, %depend_id, "{}", self);
            }
            Error::NhgIdNotFound(id) => {
                warn!(%id, "{}", self);
            }
            Error::NhgRefcntUnderflow(id) => {
                error!(%id, "{}", self);
            }
            Error::InterfaceNotFound(ifindex) => {
                warn!(%ifindex, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DplaneStopped(..) => {
                write!(f, "dataplane is not accepting updates")
            }
            Error::ProviderRegisterInvalid(..) => {
                write!(f, "invalid dataplane provider registration")
            }
            Error::ContextInitError(..) => {
                write!(f, "failed to initialize dataplane context")
            }
            Error::KernelError(..) => {
                write!(f, "kernel update failed")
            }
            Error::ThreadSpawnError(..) => {
                write!(f, "failed to spawn dataplane thread")
            }
            Error::NetlinkInitError(..) => {
                write!(f, "failed to open netlink connection")
            }
            Error::NhgIdCollision(..) => {
                write!(f, "nexthop group already exists under another ID")
            }
            Error::NhgContentMismatch(..) => {
                write!(f, "nexthop group ID already in use with other content")
            }
            Error::NhgDependNotFound(..) => {
                write!(f, "nexthop group depends on unknown ID")
            }
            Error::NhgIdNotFound(..) => {
                write!(f, "nexthop group ID not found")
            }
            Error::NhgRefcntUnderflow(..) => {
                write!(f, "nexthop group reference count underflow")
            }
            Error::InterfaceNotFound(..) => {
                write!(f, "interface not found")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ThreadSpawnError(error)
            | Error::NetlinkInitError(error) => Some(error),
            _ => None,
        }
    }
}
