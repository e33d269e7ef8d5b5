#![deny(missing_docs)]

//! YellowCert detection service
//!
//! A YOLOv8 detector for vaccination certificate elements (vaccine stamps,
//! dates, logos, signatures) served over HTTP.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use yellowcert::{AppState, ServerConfig, YoloV8, router};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::default();
//! let model = YoloV8::new(config.detector_config())?;
//!
//! let app = router(AppState::new(Arc::new(model)), &config);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

/// Bounding box module with non-maximum suppression
mod bounding_box;

/// Command line and CORS configuration
mod config;

/// API response records
mod detection;

/// Upload decoding
mod image_input;

/// Class label table
mod labels;

/// YOLOv8 model definition in candle
mod model;

/// HTTP routes
mod server;

/// YOLOv8 high level interface
mod yolov8;

pub use bounding_box::{BoundingBox, non_maximum_suppression};
pub use config::{AllowedOrigins, Args, ConfigError, FRONTEND_URL_ENV, ServerConfig};
pub use detection::{BBox, Detection, ImageDimensions, round_confidence};
pub use image_input::{DecodeError, decode_image};
pub use labels::{CLASS_NAMES, label_for};
pub use server::{ApiError, AppState, router};
pub use yolov8::{Detector, WeightsSource, YoloV8, YoloV8Config, YoloV8Error, YoloV8Size};
