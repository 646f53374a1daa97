//! The MarrowOS virtual-memory subsystem: physical-frame allocation with
//! clock eviction, a disk-backed swap store, per-process address spaces,
//! and the page-fault handler that keeps the translation cache consistent.
//!
//! Process lifecycle, scheduling, and the syscall layer live elsewhere and
//! consume this crate through [`vm::VmSystem`] and [`vm::AddressSpace`].

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod sync;
pub mod system;
pub mod vm;
