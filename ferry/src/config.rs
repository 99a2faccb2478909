// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Process-wide relay tuning.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Once,
};

/// Environment variable read once to seed [low_memory]
pub const LOW_MEMORY_ENV: &str = "FERRY_LOW_MEMORY";

static LOW_MEMORY: AtomicBool = AtomicBool::new(false);
static LOW_MEMORY_INIT: Once = Once::new();

fn parse_flag(value: &str) -> bool {
  matches!(
    value.trim().to_ascii_lowercase().as_str(),
    "1" | "true" | "yes" | "on"
  )
}

fn init_from_env() {
  LOW_MEMORY_INIT.call_once(|| {
    if let Ok(value) = std::env::var(LOW_MEMORY_ENV) {
      LOW_MEMORY.store(parse_flag(&value), Ordering::Relaxed);
    }
  });
}

/// Whether relays should favor small pooled read-wait buffers over one-shot allocations
pub fn low_memory() -> bool {
  init_from_env();
  LOW_MEMORY.load(Ordering::Relaxed)
}

/// Overrides the low-memory bias for every relay in the process
pub fn set_low_memory(enabled: bool) {
  init_from_env();
  LOW_MEMORY.store(enabled, Ordering::Relaxed);
}
