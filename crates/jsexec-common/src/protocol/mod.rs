pub mod error;
pub mod headers;
pub mod ids;
pub mod requests;
pub mod responses;


pub use error::{ProtocolError, Result};
pub use headers::{Headers, TransportHeaders, EXPIRE_TS_HEADER, REQUEST_ID_HEADER, RESPONSE_TOPIC_HEADER};
pub use ids::{DecimalU64, RequestId, ScriptId};
pub use requests::{CompileRequest, InvokeRequest, ReleaseRequest, RemoteRequest};
pub use responses::{
    CompileResponse, ErrorCode, InvokeResponse, ReleaseResponse, RemoteResponse, ResponseBody,
};
