pub mod dialer;
pub mod framed;
