//! HTTP module
//!
//! Pure parsing of raw HTTP/1.x messages, length-header correction,
//! and the shared outbound connection pool.

mod client;
mod headers;
mod request;
mod response;

pub use client::{
    prepare, response_head, ClientCertificate, ConnectionPool, HostLimits, PoolOptions,
    PooledResponse, PreparedRequest,
};
pub use headers::{
    correct_length_headers, dechunk, find_head_end, find_header, header_has_token, reframe_with_length,
    request_framing, response_framing, BodyFraming, HeaderList,
};
pub use request::{parse_request, split_authority, to_origin_form, ParsedRequest};
pub use response::{parse_response, text_response, ParsedResponse};
