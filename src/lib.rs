// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod capture;
pub mod collector;
pub mod compression;
pub mod config;
pub mod exporters;
pub mod init;
pub mod record;
pub mod sampling;
pub mod telemetry;
