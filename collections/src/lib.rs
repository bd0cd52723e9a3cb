pub mod bytes;

