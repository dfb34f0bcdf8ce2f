use thiserror::Error;

/// Boxed failure raised by an external filter translator.
pub type TranslatorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum LeadLensError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Pipeline {pipeline} does not contain stage {stage}")]
    StageNotFound { stage: String, pipeline: String },

    #[error("Unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("Stage {stage} is missing required event parameter {param}")]
    MissingEventParam { stage: String, param: String },

    #[error("Invalid rating thresholds: {0}")]
    InvalidRatingThresholds(String),

    #[error("Invalid filter on stage {stage}: {source}")]
    InvalidStageFilter {
        stage: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Pipeline {0} has no stages")]
    EmptyPipeline(String),

    #[error("Integration ids are required to scope the {0} entity")]
    MissingIntegrationIds(&'static str),

    #[error(transparent)]
    Translator(TranslatorError),
}

pub type Result<T> = std::result::Result<T, LeadLensError>;
