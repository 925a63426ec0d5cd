// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod inprocess;
pub mod k8s;
pub mod manual;
pub mod mcast;
pub mod relay;
