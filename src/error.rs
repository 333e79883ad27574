use thiserror::Error;

/// Fatal failures while bringing a render surface up. Per-frame drawing never
/// produces one of these.
#[derive(Debug, Error)]
pub enum Error {
    #[error("this system does not support {0}")]
    MissingExtension(&'static str),

    #[error("failed to allocate external texture: {0}")]
    Texture(String),

    #[error("failed to build preview drawer: {0}")]
    Drawer(String),

    #[error("failed to bind producer to texture: {0}")]
    Bind(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
