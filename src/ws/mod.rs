pub mod awareness;
pub mod connctx;
pub mod crdt;
pub mod docsession;
pub mod protocol;
pub mod registry;
