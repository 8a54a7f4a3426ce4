// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sans-I/O core of the linkbond multi-link datapath.
//!
//! The crate bonds several unreliable UDP paths into one ordered stream: a
//! weighted scheduler spreads LAN packets across tunnels, a per-tunnel
//! sequence vector detects holes and drives selective repeat, and a global
//! reorder buffer restores TCP ordering on the far side.
//!
//! Nothing in here performs I/O or reads a clock; the `linkbond` daemon
//! drives [`Core`](datapath::Core) with datagrams, tun packets and timer
//! ticks.

pub mod bandwidth;
pub mod crypto;
pub mod datapath;
pub mod packet;
pub mod recovery;
pub mod reorder;
pub mod retransmit;
pub mod scheduler;
pub mod time;
pub mod tunnel;

pub use datapath::{Core, CoreConfig, Event};
pub use tunnel::{State, TunnelConfig};
