// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire frames bundled into packets

pub mod ack;

pub use ack::AckFrame;
