// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod listener;
pub mod memory;
pub mod publisher;
pub mod router;
pub mod runtime;
