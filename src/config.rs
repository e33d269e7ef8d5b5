use std::path::PathBuf;

use argh::FromArgs;

use crate::yolov8::{WeightsSource, YoloV8Config, YoloV8Size};

/// Environment variable naming the deployed frontend origin.
pub const FRONTEND_URL_ENV: &str = "FRONTEND_URL";

/// Origins allowed no matter the environment.
const LOCAL_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://localhost:3001"];

/// Vercel preview deployments, allowed when the frontend lives on vercel.
const VERCEL_PREVIEW_ORIGINS: &str = "https://*.vercel.app";

#[derive(FromArgs, Debug)]
/// YellowCert detection API server
pub struct Args {
    /// address to listen on
    #[argh(option, default = "String::from(\"0.0.0.0\")")]
    pub host: String,

    /// port to listen on
    #[argh(option, default = "8000")]
    pub port: u16,

    /// path to the trained safetensors weights
    #[argh(option, default = "PathBuf::from(\"models/best.safetensors\")")]
    pub model: PathBuf,

    /// pretrained model used when the weights file is missing: n, s, m, l, x
    #[argh(option, default = "YoloV8Size::N")]
    pub fallback_size: YoloV8Size,

    /// minimum score of a reported detection
    #[argh(option, default = "0.1")]
    pub confidence_threshold: f32,

    /// overlap (iou) above which boxes of a class are suppressed
    #[argh(option, default = "0.7")]
    pub nms_threshold: f32,

    /// maximum number of detections per image
    #[argh(option, default = "300")]
    pub max_detections: usize,

    // candle checkpoints do not record the training imgsz, so this has to be
    // set to the size the weights were trained at (e.g. 1024 or 1280)
    /// longest side of the network input, a multiple of 32; use the training imgsz
    #[argh(option, default = "640")]
    pub image_size: usize,

    /// largest accepted upload, in megabytes
    #[argh(option, default = "20")]
    pub max_upload_mb: usize,

    /// run inference on cuda:0 when available
    #[argh(switch)]
    pub use_gpu: bool,

    /// frontend origin allowed by CORS, overrides FRONTEND_URL
    #[argh(option)]
    pub frontend_url: Option<String>,
}

/// Configuration error.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    /// A threshold outside `[0, 1]`.
    #[error("{name} must be within [0, 1], got {value}")]
    InvalidThreshold {
        /// Option name.
        name: &'static str,
        /// Rejected value.
        value: f32,
    },

    /// An input size that the network strides cannot divide.
    #[error("image size must be a positive multiple of 32, got {0}")]
    InvalidImageSize(usize),

    /// A zero upload limit.
    #[error("upload limit must be at least 1 MB")]
    InvalidUploadLimit,
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Trained weights location.
    pub model_path: PathBuf,
    /// Pretrained size used when `model_path` is missing.
    pub fallback_size: YoloV8Size,
    /// Detection score threshold.
    pub confidence_threshold: f32,
    /// NMS IoU threshold.
    pub nms_threshold: f32,
    /// Detections reported per image.
    pub max_detections: usize,
    /// Network input size.
    pub image_size: usize,
    /// Inference device selection.
    pub use_cpu: bool,
    /// Largest accepted request body.
    pub max_upload_bytes: usize,
    /// CORS allow-list.
    pub allowed_origins: AllowedOrigins,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_path: PathBuf::from("models/best.safetensors"),
            fallback_size: YoloV8Size::N,
            confidence_threshold: 0.1,
            nms_threshold: 0.7,
            max_detections: 300,
            image_size: 640,
            use_cpu: true,
            max_upload_bytes: 20 * 1024 * 1024,
            allowed_origins: AllowedOrigins::new(None),
        }
    }
}

impl ServerConfig {
    /// Validate the command line, reading `FRONTEND_URL` when no frontend flag is given.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let frontend_env = std::env::var(FRONTEND_URL_ENV).ok();
        Self::build(args, frontend_env)
    }

    fn build(args: Args, frontend_env: Option<String>) -> Result<Self, ConfigError> {
        check_threshold("confidence-threshold", args.confidence_threshold)?;
        check_threshold("nms-threshold", args.nms_threshold)?;
        if args.image_size == 0 || args.image_size % 32 != 0 {
            return Err(ConfigError::InvalidImageSize(args.image_size));
        }
        if args.max_upload_mb == 0 {
            return Err(ConfigError::InvalidUploadLimit);
        }
        let frontend_url = args.frontend_url.or(frontend_env);

        Ok(Self {
            host: args.host,
            port: args.port,
            model_path: args.model,
            fallback_size: args.fallback_size,
            confidence_threshold: args.confidence_threshold,
            nms_threshold: args.nms_threshold,
            max_detections: args.max_detections,
            image_size: args.image_size,
            use_cpu: !args.use_gpu,
            max_upload_bytes: args.max_upload_mb * 1024 * 1024,
            allowed_origins: AllowedOrigins::new(frontend_url.as_deref()),
        })
    }

    /// Detector configuration, applying the missing-weights fallback.
    pub fn detector_config(&self) -> YoloV8Config {
        YoloV8Config {
            weights: WeightsSource::resolve(&self.model_path, self.fallback_size),
            confidence_threshold: self.confidence_threshold,
            nms_threshold: self.nms_threshold,
            max_detections: self.max_detections,
            image_size: self.image_size,
            use_cpu: self.use_cpu,
        }
    }
}

fn check_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum OriginPattern {
    Exact(String),
    /// `scheme://*.domain`, any non-empty subdomain label sequence.
    Subdomains {
        scheme: String,
        suffix: String,
    },
}

impl OriginPattern {
    fn parse(origin: &str) -> Self {
        let origin = origin.trim().trim_end_matches('/');
        match origin.split_once("://*") {
            Some((scheme, suffix)) if suffix.starts_with('.') => OriginPattern::Subdomains {
                scheme: format!("{scheme}://"),
                suffix: suffix.to_string(),
            },
            _ => OriginPattern::Exact(origin.to_string()),
        }
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginPattern::Exact(allowed) => allowed == origin,
            OriginPattern::Subdomains { scheme, suffix } => origin
                .strip_prefix(scheme.as_str())
                .and_then(|host| host.strip_suffix(suffix.as_str()))
                .is_some_and(|sub| !sub.is_empty() && !sub.contains(['/', ':'])),
        }
    }
}

impl std::fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginPattern::Exact(origin) => write!(f, "{origin}"),
            OriginPattern::Subdomains { scheme, suffix } => write!(f, "{scheme}*{suffix}"),
        }
    }
}

/// Origins allowed to call the API from a browser.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowedOrigins {
    patterns: Vec<OriginPattern>,
}

impl AllowedOrigins {
    /// The local development origins, plus the frontend origin when given.
    ///
    /// A frontend hosted on `vercel.app` also allows its preview deployments.
    pub fn new(frontend_url: Option<&str>) -> Self {
        let mut patterns: Vec<OriginPattern> =
            LOCAL_ORIGINS.iter().map(|o| OriginPattern::parse(o)).collect();
        if let Some(url) = frontend_url.map(str::trim).filter(|url| !url.is_empty()) {
            patterns.push(OriginPattern::parse(url));
            if url.contains("vercel.app") {
                patterns.push(OriginPattern::parse(VERCEL_PREVIEW_ORIGINS));
            }
        }
        Self { patterns }
    }

    /// Whether a request `Origin` header value is allowed.
    pub fn is_allowed(&self, origin: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(origin))
    }
}

impl std::fmt::Display for AllowedOrigins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let patterns: Vec<String> = self.patterns.iter().map(ToString::to_string).collect();
        write!(f, "{}", patterns.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args::from_args(&["yellowcert"], &[]).expect("default arguments parse")
    }

    #[test]
    fn test_default_args() -> Result<(), ConfigError> {
        let config = ServerConfig::build(args(), None)?;
        assert_eq!(config.port, 8000);
        assert_eq!(config.model_path, PathBuf::from("models/best.safetensors"));
        assert_eq!(config.confidence_threshold, 0.1);
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
        assert!(config.use_cpu);
        assert_eq!(config.allowed_origins, AllowedOrigins::new(None));
        Ok(())
    }

    #[test]
    fn test_parse_flags() -> Result<(), ConfigError> {
        let args = Args::from_args(
            &["yellowcert"],
            &["--port", "9000", "--fallback-size", "m", "--use-gpu"],
        )
        .expect("flags parse");
        let config = ServerConfig::build(args, None)?;
        assert_eq!(config.port, 9000);
        assert_eq!(config.fallback_size, YoloV8Size::M);
        assert!(!config.use_cpu);
        Ok(())
    }

    #[test]
    fn test_parse_thresholds_and_image_size() -> Result<(), ConfigError> {
        let args = Args::from_args(
            &["yellowcert"],
            &["--nms-threshold", "0.5", "--image-size", "1024"],
        )
        .expect("flags parse");
        let config = ServerConfig::build(args, None)?;
        assert_eq!(config.nms_threshold, 0.5);
        assert_eq!(config.image_size, 1024);
        assert_eq!(config.detector_config().image_size, 1024);
        Ok(())
    }

    #[test]
    fn test_invalid_values() {
        let mut bad = args();
        bad.confidence_threshold = 1.5;
        assert_eq!(
            ServerConfig::build(bad, None).err(),
            Some(ConfigError::InvalidThreshold {
                name: "confidence-threshold",
                value: 1.5
            })
        );

        let mut bad = args();
        bad.image_size = 600;
        assert_eq!(
            ServerConfig::build(bad, None).err(),
            Some(ConfigError::InvalidImageSize(600))
        );

        let mut bad = args();
        bad.max_upload_mb = 0;
        assert_eq!(
            ServerConfig::build(bad, None).err(),
            Some(ConfigError::InvalidUploadLimit)
        );
    }

    #[test]
    fn test_frontend_flag_overrides_env() -> Result<(), ConfigError> {
        let mut args = args();
        args.frontend_url = Some("https://certs.example.org".to_string());
        let config = ServerConfig::build(args, Some("https://other.example.org".to_string()))?;
        assert!(config.allowed_origins.is_allowed("https://certs.example.org"));
        assert!(!config.allowed_origins.is_allowed("https://other.example.org"));
        Ok(())
    }

    #[test]
    fn test_local_origins_always_allowed() {
        let origins = AllowedOrigins::new(None);
        assert!(origins.is_allowed("http://localhost:3000"));
        assert!(origins.is_allowed("http://localhost:3001"));
        assert!(!origins.is_allowed("http://localhost:8080"));
        assert!(!origins.is_allowed("https://evil.example.com"));
    }

    #[test]
    fn test_frontend_origin() {
        let origins = AllowedOrigins::new(Some("https://yellowcert.example.com/"));
        assert!(origins.is_allowed("https://yellowcert.example.com"));
        assert!(!origins.is_allowed("https://preview.vercel.app"));
    }

    #[test]
    fn test_vercel_previews() {
        let origins = AllowedOrigins::new(Some("https://yellowcert.vercel.app"));
        assert!(origins.is_allowed("https://yellowcert.vercel.app"));
        assert!(origins.is_allowed("https://yellowcert-git-main-team.vercel.app"));
        assert!(!origins.is_allowed("http://yellowcert.vercel.app"));
        assert!(!origins.is_allowed("https://vercel.app"));
        assert!(!origins.is_allowed("https://evil.com/.vercel.app"));
        assert_eq!(
            origins.to_string(),
            "http://localhost:3000, http://localhost:3001, https://yellowcert.vercel.app, https://*.vercel.app"
        );
    }

    #[test]
    fn test_detector_config_fallback() {
        let config = ServerConfig {
            model_path: PathBuf::from("no/such/weights.safetensors"),
            fallback_size: YoloV8Size::S,
            ..Default::default()
        };
        let detector = config.detector_config();
        assert_eq!(detector.weights, WeightsSource::Hub(YoloV8Size::S));
        assert_eq!(detector.nms_threshold, 0.7);
    }
}
