//! Operators for building the DStream graph
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use dstream::config::StreamingConfig;
//! use dstream::context::StreamingContext;
//! use dstream::operators::*;
//!
//! let config = StreamingConfig::builder()
//!     .batch_interval(Duration::from_secs(1))
//!     .build();
//! let ctx = StreamingContext::new(config).unwrap();
//! let (lines, queue) = ctx.queue_stream::<String>("lines").unwrap();
//! lines
//!     .flat_map("words", |line: String| {
//!         line.split(' ').map(str::to_string).collect::<Vec<_>>()
//!     })
//!     .unwrap()
//!     .map("pairs", |word| (word, 1u64))
//!     .unwrap()
//!     .reduce_by_key("counts", |a, b| a + b)
//!     .unwrap()
//!     .print("print", 10)
//!     .unwrap();
//! queue.push(vec!["a b".to_string(), "a".to_string()]);
//! ```
mod join;
mod map;
mod output;
mod reduce;
mod reduce_window;
mod source;
mod state;
mod transform;
mod union;
mod window;

pub use join::Join;
pub use map::{Filter, FlatMap, Map};
pub use output::{ForeachBatch, Print};
pub use reduce::{Count, ReduceByKey};
pub use reduce_window::{KeyFilter, ReduceByKeyAndWindow};
pub use source::InputQueue;
pub use state::UpdateStateByKey;
pub use transform::Transform;
pub use union::Union;
pub use window::Window;

// marker used to seal the traits implementing operators
// on DStream
mod sealed {
    use crate::graph::DStream;

    pub trait Sealed {}

    impl<V> Sealed for DStream<V> {}
}
