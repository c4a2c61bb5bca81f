// Copyright the tern-quic project authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod flow_controller;
pub mod receive_buffer;
pub mod send_buffer;

pub use flow_controller::FlowController;
pub use receive_buffer::ReceiveBuffer;
pub use send_buffer::SendBuffer;
