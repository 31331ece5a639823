// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-side tools callable by any provider during the agentic loop.

pub mod builtin;
mod dispatcher;

pub use dispatcher::{
    DeclarationFormat, ServerTool, ToolCallRequest, ToolContext, ToolDispatcher,
};
