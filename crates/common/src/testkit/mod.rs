/// In-memory collaborators for exercising the mount service without a cloud
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::MemoryClient;
///
/// let client = MemoryClient::new();
/// let docs = client.add_directory(client.root(), "docs")?;
/// client.add_file(docs, "a.txt", b"hello")?;
///
/// // every mutation is recorded as a node event
/// let events = client.take_events();
/// ```
mod memory_client;

pub use memory_client::MemoryClient;
