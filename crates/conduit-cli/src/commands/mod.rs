mod parse_uri;
pub mod serve;

pub use parse_uri::ParseUriCommand;
pub use serve::ServeCommand;
