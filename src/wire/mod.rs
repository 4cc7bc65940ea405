//! The framed wire protocol (C1/C2): a self-describing element tree, a
//! record reader/writer built on top of it, and the message catalog that
//! gives the tree its domain meaning.

pub mod codec;
pub mod element;
pub mod message;

pub use codec::{read_record, write_record, ReadOutcome};
pub use element::Element;
pub use message::{Envelope, MessageBody};
