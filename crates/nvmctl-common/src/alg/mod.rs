pub mod bitmap;
pub mod fletcher;
pub mod seq;
