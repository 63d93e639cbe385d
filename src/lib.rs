pub mod auth;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod rpc;
pub mod transport;
pub mod types;

pub use auth::{
    BrowserCookieExtractor, CookieFile, CookieLoader, CookieStore, Credentials, EnvCookieLoader,
    ErrorCallback, PersistenceCallback, RotationGate,
};
pub use client::{ChatSession, Client, ClientBuilder, GenerateOptions, Phase};
pub use config::ClientConfig;
pub use constants::Model;
pub use error::{GeminiError, Result};
pub use rpc::{RpcCall, RpcReply};
pub use transport::{
    CancelToken, HttpRequest, HttpResponse, Method, RequestBody, ReqwestTransport, Transport,
    TransportError, TransportOptions,
};
pub use types::{
    Candidate, Gem, GemJar, GeneratedImage, ImageRef, Metadata, ModelOutput, UploadedFile,
    WebImage,
};
