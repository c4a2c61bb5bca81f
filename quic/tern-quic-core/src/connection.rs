// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod control_frames;

pub use control_frames::ControlFrameManager;
