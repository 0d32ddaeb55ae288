// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.


//! Cluster monitoring, server selection and connection pooling for MongoDB deployments.
//!
//! A [`Cluster`](topology::Cluster) keeps a description of the deployment up to date by
//! monitoring every server, selects servers for operations and hands out pooled connections.
//! Documents are encoded by a user supplied [`Codec`](wire::Codec).

#![warn(clippy::all)]
#![allow(clippy::from_over_into)]
#![forbid(unsafe_code)]

pub use self::{
	common::*,
	utils::{CancellationToken, Registration, __DebugWrapper__},
	description::*,
	selector::*,
	topology::{Cluster, ClusterBuilder},
	server::{Server, Channel},
	apm::{ClusterEvent, EventSubscriber, EventDispatcher}
};

pub mod common;
pub mod description;
pub mod stream;
pub mod wire;
pub mod auth;
pub mod connection;
pub mod pool;
pub mod monitor;
pub mod server;
pub mod selector;
pub mod topology;
pub mod srv;
pub mod apm;
pub mod utils;
#[cfg(test)]
mod testing;

pub static DRIVER_NAME: &str = "mongo-cluster";
