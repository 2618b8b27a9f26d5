//! Target resolution, reference encoding and the request pipeline.

pub mod codec;
pub mod dispatcher;
pub mod media;
pub mod resolver;
pub mod tee;
