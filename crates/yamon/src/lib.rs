// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod accumulator;
pub mod agent_http;
pub mod audit;
pub mod collectors;
pub mod config;
pub mod cursor;
pub mod envelope;
pub mod errors;
pub mod forward;
pub mod http_utils;
pub mod journal;
pub mod prometheus;
pub mod scheduler;
pub mod script;
pub mod sink;
pub mod storage;
pub mod tail;
pub mod telemetry;
