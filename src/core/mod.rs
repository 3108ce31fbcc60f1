//! # Core Codec Components
//!
//! Cursor-based binary primitives shared by every packet implementation.
//!
//! ## Components
//! - **PacketReader**: read cursor over buffered incoming bytes
//! - **PacketWriter**: write cursor into a pooled outgoing buffer
//!
//! ## Wire Format
//! ```text
//! [Id(1)] [Payload(N)] [Id(1)] [Payload(M)] ...
//! ```
//! There is no generic length prefix: every packet type knows its own size or encodes
//! it inside its payload. Integers are big-endian.

pub mod reader;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;
