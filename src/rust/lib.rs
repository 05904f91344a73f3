// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod block;
pub mod config;
pub mod iosched;
pub mod runtime;

pub use self::{
    block::{
        Bio,
        Direction,
        QueueConfig,
        Request,
        RequestId,
        RequestQueue,
    },
    config::Config,
    iosched::{
        deadline::{
            DeadlineScheduler,
            Tunables,
        },
        Elevator,
    },
    runtime::fail::Fail,
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Fails the enclosing `anyhow::Result` function if the two expressions differ.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (left, right) => {
                if !(*left == *right) {
                    ::anyhow::bail!(
                        "ensure_eq!({}, {}) failed\n  left: {:?}\n right: {:?}",
                        stringify!($left),
                        stringify!($right),
                        left,
                        right
                    );
                }
            },
        }
    };
}

/// Fails the enclosing `anyhow::Result` function if the two expressions are equal.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {
        match (&$left, &$right) {
            (left, right) => {
                if *left == *right {
                    ::anyhow::bail!(
                        "ensure_neq!({}, {}) failed\n  both: {:?}",
                        stringify!($left),
                        stringify!($right),
                        left
                    );
                }
            },
        }
    };
}
