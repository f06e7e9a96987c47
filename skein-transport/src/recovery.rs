// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss recovery and congestion control

pub mod bbr;

pub use bbr::Bbr;
