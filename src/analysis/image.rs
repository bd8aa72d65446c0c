//! Image analysis: classify, route by type, extract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use super::parse::{ParsedChanges, parse_changes, parse_classification};
use super::prompts::{
    IMAGE_CLASSIFICATION_INSTRUCTION, IMAGE_CLASSIFICATION_VERSION, VISUAL_CHANGE_INSTRUCTION,
    VISUAL_CHANGE_VERSION, image_classification_system_prompt, visual_change_system_prompt,
};
use super::types::{
    AnalysisMetadata, ChangeEventProposal, Finding, ImageClassification, ImageType, PhaseReport,
    SourceType,
};
use super::with_deadline;
use crate::error::AnalysisError;
use crate::extract::{ImageNormalizer, ImageProfile, NormalizedImage};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::project::ProjectContext;

const CLASSIFY_MAX_TOKENS: u32 = 512;
const EXTRACT_MAX_TOKENS: u32 = 2048;

/// Assigns an `ImageType` to an image.
#[async_trait]
pub trait ImageClassifier: Send + Sync {
    fn model_name(&self) -> &str;

    async fn classify(
        &self,
        image: &NormalizedImage,
    ) -> Result<(ImageClassification, AnalysisMetadata), AnalysisError>;
}

/// Extracts change proposals from an image of a known type.
#[async_trait]
pub trait ImageChangeExtractor: Send + Sync {
    fn model_name(&self) -> &str;

    async fn extract(
        &self,
        image: &NormalizedImage,
        image_type: ImageType,
        ctx: &ProjectContext,
    ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError>;
}

/// Run `extractor` unless `image_type` rules extraction out.
///
/// `other` and `document` images return a skipped result without calling
/// the extractor.
pub async fn extract_changes(
    extractor: &dyn ImageChangeExtractor,
    image: &NormalizedImage,
    image_type: ImageType,
    ctx: &ProjectContext,
) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
    if image_type.skips_extraction() {
        info!(image_type = %image_type, "Skipping visual change detection");
        let metadata = AnalysisMetadata {
            skipped: true,
            reason: Some(format!("image_type={image_type}")),
            image_type: Some(image_type),
            ..AnalysisMetadata::new(VISUAL_CHANGE_VERSION, extractor.model_name())
        };
        return Ok((Vec::new(), metadata));
    }
    extractor.extract(image, image_type, ctx).await
}

/// Vision-model `ImageClassifier`.
pub struct LlmImageClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmImageClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ImageClassifier for LlmImageClassifier {
    fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    async fn classify(
        &self,
        image: &NormalizedImage,
    ) -> Result<(ImageClassification, AnalysisMetadata), AnalysisError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(image_classification_system_prompt()),
            ChatMessage::user_with_image(
                &image.media_type,
                &image.data,
                IMAGE_CLASSIFICATION_INSTRUCTION,
            ),
        ])
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let started = Instant::now();
        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|source| AnalysisError::Capability {
                capability: "image_classifier",
                source,
            })?;

        let mut metadata =
            AnalysisMetadata::new(IMAGE_CLASSIFICATION_VERSION, self.llm.model_name());
        metadata.tokens_used = response.total_tokens();
        metadata.processing_time_ms = started.elapsed().as_millis() as u64;

        let classification = match parse_classification(&response.content) {
            Ok(c) => c,
            Err(_) => {
                metadata.error = Some("JSON parse failed".into());
                ImageClassification::other("Parse error")
            }
        };
        metadata.image_type = Some(classification.image_type);

        info!(
            image_type = %classification.image_type,
            confidence = classification.confidence,
            tokens = metadata.tokens_used,
            "Image classified"
        );
        Ok((classification, metadata))
    }
}

/// Vision-model `ImageChangeExtractor`.
pub struct LlmImageChangeExtractor {
    llm: Arc<dyn LlmProvider>,
}

impl LlmImageChangeExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ImageChangeExtractor for LlmImageChangeExtractor {
    fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    async fn extract(
        &self,
        image: &NormalizedImage,
        image_type: ImageType,
        ctx: &ProjectContext,
    ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(visual_change_system_prompt(image_type, ctx)),
            ChatMessage::user_with_image(&image.media_type, &image.data, VISUAL_CHANGE_INSTRUCTION),
        ])
        .with_max_tokens(EXTRACT_MAX_TOKENS);

        let started = Instant::now();
        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|source| AnalysisError::Capability {
                capability: "image_change_extractor",
                source,
            })?;

        let mut metadata = AnalysisMetadata::new(VISUAL_CHANGE_VERSION, self.llm.model_name());
        metadata.tokens_used = response.total_tokens();
        metadata.processing_time_ms = started.elapsed().as_millis() as u64;
        metadata.image_type = Some(image_type);

        match parse_changes(&response.content) {
            ParsedChanges::Changes(proposals) => Ok((proposals, metadata)),
            ParsedChanges::Malformed { .. } => {
                Ok((Vec::new(), metadata.with_error("JSON parse failed")))
            }
        }
    }
}

/// Raw image bytes awaiting analysis.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Image analysis phase. Images are analyzed concurrently; a failure on one
/// image never affects the others.
#[derive(Clone)]
pub struct ImagePhase {
    normalizer: Arc<dyn ImageNormalizer>,
    classifier: Arc<dyn ImageClassifier>,
    extractor: Arc<dyn ImageChangeExtractor>,
    call_timeout: Duration,
}

impl ImagePhase {
    pub fn new(
        normalizer: Arc<dyn ImageNormalizer>,
        classifier: Arc<dyn ImageClassifier>,
        extractor: Arc<dyn ImageChangeExtractor>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            normalizer,
            classifier,
            extractor,
            call_timeout,
        }
    }

    pub async fn run(
        &self,
        images: Vec<ImageInput>,
        ctx: &ProjectContext,
        source_type: SourceType,
    ) -> PhaseReport {
        let reports = join_all(
            images
                .iter()
                .map(|image| self.analyze_one(image, ctx, source_type)),
        )
        .await;

        let mut merged = PhaseReport::empty();
        for report in reports {
            merged.extend(report);
        }
        merged
    }

    /// Re-encode with the classified type's profile when it differs from
    /// the one used for classification.
    fn reprofile(
        &self,
        input: &ImageInput,
        image: NormalizedImage,
        image_type: ImageType,
    ) -> NormalizedImage {
        if ImageProfile::for_image_type(Some(image_type)) == ImageProfile::DEFAULT {
            return image;
        }
        match self
            .normalizer
            .normalize(&input.bytes, &input.media_type, &input.name, Some(image_type))
        {
            Ok(sharper) => sharper,
            Err(e) => {
                warn!(image = %input.name, error = %e, "Profile re-encode failed, keeping default");
                image
            }
        }
    }

    async fn analyze_one(
        &self,
        input: &ImageInput,
        ctx: &ProjectContext,
        source_type: SourceType,
    ) -> PhaseReport {
        let mut report = PhaseReport::empty();

        let image = match self
            .normalizer
            .normalize(&input.bytes, &input.media_type, &input.name, None)
        {
            Ok(image) => image,
            Err(e) => {
                warn!(image = %input.name, error = %e, "Image normalization failed");
                report.calls.push(
                    AnalysisMetadata::new(IMAGE_CLASSIFICATION_VERSION, self.classifier.model_name())
                        .with_error(e.to_string()),
                );
                return report;
            }
        };

        let classify = self.classifier.classify(&image);
        let classification =
            match with_deadline("image_classifier", self.call_timeout, classify).await {
                Ok((classification, metadata)) => {
                    report.calls.push(metadata);
                    classification
                }
                Err(e) => {
                    warn!(image = %input.name, error = %e, "Image classification failed");
                    report.calls.push(
                        AnalysisMetadata::failed(
                            IMAGE_CLASSIFICATION_VERSION,
                            self.classifier.model_name(),
                            &e,
                        ),
                    );
                    return report;
                }
            };

        let image = self.reprofile(input, image, classification.image_type);
        let extract = extract_changes(
            self.extractor.as_ref(),
            &image,
            classification.image_type,
            ctx,
        );
        match with_deadline("image_change_extractor", self.call_timeout, extract).await {
            Ok((proposals, metadata)) => {
                report
                    .findings
                    .extend(proposals.into_iter().filter(|p| p.is_change_event).map(|proposal| {
                        Finding {
                            proposal,
                            metadata: metadata.clone(),
                            source_type,
                            attachment: Some(input.name.clone()),
                        }
                    }));
                report.calls.push(metadata);
            }
            Err(e) => {
                warn!(image = %input.name, error = %e, "Visual change extraction failed");
                report.calls.push(AnalysisMetadata {
                    image_type: Some(classification.image_type),
                    ..AnalysisMetadata::failed(VISUAL_CHANGE_VERSION, self.extractor.model_name(), &e)
                });
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PassthroughNormalizer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier(ImageType);

    #[async_trait]
    impl ImageClassifier for FixedClassifier {
        fn model_name(&self) -> &str {
            "mock-vision"
        }

        async fn classify(
            &self,
            _image: &NormalizedImage,
        ) -> Result<(ImageClassification, AnalysisMetadata), AnalysisError> {
            Ok((
                ImageClassification {
                    image_type: self.0,
                    confidence: 0.9,
                    description: "test".into(),
                },
                AnalysisMetadata::new(IMAGE_CLASSIFICATION_VERSION, "mock-vision"),
            ))
        }
    }

    #[derive(Default)]
    struct CountingExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageChangeExtractor for CountingExtractor {
        fn model_name(&self) -> &str {
            "mock-vision"
        }

        async fn extract(
            &self,
            _image: &NormalizedImage,
            image_type: ImageType,
            _ctx: &ProjectContext,
        ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut meta = AnalysisMetadata::new(VISUAL_CHANGE_VERSION, "mock-vision");
            meta.image_type = Some(image_type);
            Ok((
                vec![ChangeEventProposal::new("Move island 2ft east", 0.85).with_area("Kitchen")],
                meta,
            ))
        }
    }

    fn png(len: usize) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.resize(len, 0);
        bytes
    }

    fn sample_image() -> NormalizedImage {
        PassthroughNormalizer
            .normalize(&png(64), "image/png", "a.png", None)
            .unwrap()
    }

    #[tokio::test]
    async fn other_and_document_never_call_extractor() {
        let extractor = CountingExtractor::default();
        for image_type in [ImageType::Other, ImageType::Document] {
            let (proposals, meta) =
                extract_changes(&extractor, &sample_image(), image_type, &ProjectContext::default())
                    .await
                    .unwrap();
            assert!(proposals.is_empty());
            assert!(meta.skipped);
            assert_eq!(meta.tokens_used, 0);
            assert_eq!(meta.reason, Some(format!("image_type={image_type}")));
        }
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn plan_images_are_extracted() {
        let extractor = Arc::new(CountingExtractor::default());
        let phase = ImagePhase::new(
            Arc::new(PassthroughNormalizer),
            Arc::new(FixedClassifier(ImageType::AnnotatedPlan)),
            extractor.clone(),
            Duration::from_secs(5),
        );
        let images = vec![
            ImageInput {
                name: "plan-1.png".into(),
                media_type: "image/png".into(),
                bytes: png(100),
            },
            ImageInput {
                name: "plan-2.png".into(),
                media_type: "image/png".into(),
                bytes: png(100),
            },
        ];
        let report = phase
            .run(images, &ProjectContext::default(), SourceType::Image)
            .await;

        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.calls.len(), 4);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert!(report.findings.iter().all(|f| f.source_type == SourceType::Image));
        assert_eq!(
            report.findings[0].metadata.image_type,
            Some(ImageType::AnnotatedPlan)
        );
    }

    #[tokio::test]
    async fn skipped_image_yields_skip_record() {
        let extractor = Arc::new(CountingExtractor::default());
        let phase = ImagePhase::new(
            Arc::new(PassthroughNormalizer),
            Arc::new(FixedClassifier(ImageType::Other)),
            extractor.clone(),
            Duration::from_secs(5),
        );
        let report = phase
            .run(
                vec![ImageInput {
                    name: "logo.png".into(),
                    media_type: "image/png".into(),
                    bytes: png(32),
                }],
                &ProjectContext::default(),
                SourceType::Image,
            )
            .await;
        assert!(report.findings.is_empty());
        assert!(report.calls.iter().any(|c| c.skipped));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreadable_image_is_isolated() {
        let extractor = Arc::new(CountingExtractor::default());
        let phase = ImagePhase::new(
            Arc::new(PassthroughNormalizer),
            Arc::new(FixedClassifier(ImageType::FieldPhoto)),
            extractor.clone(),
            Duration::from_secs(5),
        );
        let report = phase
            .run(
                vec![
                    ImageInput {
                        name: "broken".into(),
                        media_type: "image/png".into(),
                        bytes: b"garbage".to_vec(),
                    },
                    ImageInput {
                        name: "site.png".into(),
                        media_type: "image/png".into(),
                        bytes: png(64),
                    },
                ],
                &ProjectContext::default(),
                SourceType::Image,
            )
            .await;
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].attachment.as_deref(), Some("site.png"));
        assert_eq!(report.errors().count(), 1);
    }

    /// Passthrough that remembers which profile each call asked for.
    #[derive(Default)]
    struct RecordingNormalizer {
        profiles: std::sync::Mutex<Vec<Option<ImageType>>>,
    }

    impl ImageNormalizer for RecordingNormalizer {
        fn normalize(
            &self,
            bytes: &[u8],
            declared_media_type: &str,
            filename: &str,
            image_type: Option<ImageType>,
        ) -> Result<NormalizedImage, crate::error::ExtractError> {
            self.profiles.lock().unwrap().push(image_type);
            PassthroughNormalizer.normalize(bytes, declared_media_type, filename, image_type)
        }
    }

    #[tokio::test]
    async fn classified_plans_are_reencoded_with_their_profile() {
        for (image_type, expected) in [
            (ImageType::AnnotatedPlan, vec![None, Some(ImageType::AnnotatedPlan)]),
            (ImageType::FieldPhoto, vec![None]),
        ] {
            let normalizer = Arc::new(RecordingNormalizer::default());
            let phase = ImagePhase::new(
                normalizer.clone(),
                Arc::new(FixedClassifier(image_type)),
                Arc::new(CountingExtractor::default()),
                Duration::from_secs(5),
            );
            phase
                .run(
                    vec![ImageInput {
                        name: "img.png".into(),
                        media_type: "image/png".into(),
                        bytes: png(64),
                    }],
                    &ProjectContext::default(),
                    SourceType::Image,
                )
                .await;
            assert_eq!(*normalizer.profiles.lock().unwrap(), expected, "{image_type}");
        }
    }
}
