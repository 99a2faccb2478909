// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod channel;
pub mod conn;
pub mod decorators;
pub mod error;
pub mod network;
