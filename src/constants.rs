pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504];

/// Ranked default pool, most capable first.
pub const DEFAULT_MODEL_POOL: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
];

/// Sentinel accepted for `model` meaning "use the ranked pool".
pub const AUTO_MODEL: &str = "auto";

/// Gemini API endpoints
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_API_KEY_HEADER: &str = "x-goog-api-key";
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Generation limits
pub const HARD_CAP_OUTPUT_TOKENS: u32 = 8192;
pub const CANDIDATE_COUNT: u32 = 1;

/// Retry defaults
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 600;
pub const RETRY_JITTER_MS: u64 = 400;

/// Request budget
pub const DEFAULT_TIMEOUT_MS: u64 = 55_000;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// Continuation loop
pub const DEFAULT_MAX_CHUNKS: u32 = 3;
pub const DEFAULT_MAX_CHUNKS_LONG: u32 = 4;
pub const MAX_CHUNKS_CEILING: u32 = 10;
pub const CONTINUATION_SAFETY_MARGIN_MS: u64 = 2_500;
pub const TRUNCATION_WINDOW_CHARS: usize = 80;
pub const DEDUPE_WINDOW_CHARS: usize = 200;

/// Streaming relay
pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;
pub const RELAY_CHANNEL_CAPACITY: usize = 64;
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;

/// Placeholder used when a request carries nothing to answer.
pub const EMPTY_REQUEST_PLACEHOLDER: &str = "begin now";

/// Raw upstream bodies are truncated to this many chars in diagnostics.
pub const RAW_BODY_SNIPPET_CHARS: usize = 2_000;

/// Gemini harm categories that receive an explicit threshold.
pub const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Media limits
pub const IMAGE_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
];
pub const AUDIO_MIME_TYPES: &[&str] = &[
    "audio/wav",
    "audio/mp3",
    "audio/mpeg",
    "audio/aac",
    "audio/ogg",
    "audio/flac",
    "audio/webm",
];
pub const MAX_ATTACHMENT_BYTES: usize = 7 * 1024 * 1024;
pub const MAX_IMAGES_PER_MESSAGE: usize = 4;
pub const MAX_INLINE_BYTES_PER_REQUEST: usize = 15 * 1024 * 1024;
