//! Best-effort enrichment applied to new listings before they are stored:
//! title/description translation and category assignment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealspy_adapters::model::complete_within;
use dealspy_adapters::normalize::truncate_chars;
use dealspy_adapters::TextModel;
use dealspy_core::{Category, Country, Language, NewDeal, Translations};
use tracing::warn;

pub const DESCRIPTION_TRANSLATE_CHARS: usize = 200;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSLATE_MAX_TOKENS: u32 = 500;
const CATEGORIZE_MAX_TOKENS: u32 = 20;

/// Never fails: on any error the input text comes back unchanged.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target: Language, source: Option<Language>) -> String;
}

/// Never fails: any error or unusable answer is `Category::Other`.
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize(&self, title: &str, description: Option<&str>) -> Category;
}

/// Returns every text untranslated. Used when no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranslator;

#[async_trait]
impl Translator for PassthroughTranslator {
    async fn translate(&self, text: &str, _target: Language, _source: Option<Language>) -> String {
        text.to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedCategorizer(pub Category);

impl Default for FixedCategorizer {
    fn default() -> Self {
        Self(Category::Other)
    }
}

#[async_trait]
impl Categorizer for FixedCategorizer {
    async fn categorize(&self, _title: &str, _description: Option<&str>) -> Category {
        self.0
    }
}

fn language_name(lang: Language) -> &'static str {
    match lang {
        Language::Hu => "Hungarian",
        Language::En => "English",
        Language::De => "German",
    }
}

const HUNGARIAN_ACCENTS: &str = "áéíóöőúüűÁÉÍÓÖŐÚÜŰ";

/// Plain latin text carrying Hungarian accents is taken as already Hungarian.
fn looks_hungarian(text: &str) -> bool {
    let plain = text.chars().all(|c| {
        c.is_ascii_alphanumeric() || c.is_whitespace() || ".,!?-".contains(c) || HUNGARIAN_ACCENTS.contains(c)
    });
    plain && text.chars().any(|c| HUNGARIAN_ACCENTS.contains(c))
}

pub fn translation_prompt(text: &str, target: Language, source: Option<Language>) -> String {
    let from = source.map(|s| format!(" from {}", language_name(s))).unwrap_or_default();
    format!(
        "You are a translator. Translate the given text{from} to {target}.\n\
         Keep technical terms accurate (machine names, model numbers, etc.).\n\
         If the text is already in the target language, return it as-is.\n\
         Only return the translation, nothing else. No explanations.\n\n\
         Text:\n{text}",
        target = language_name(target),
    )
}

pub struct ModelTranslator {
    model: Arc<dyn TextModel>,
    timeout: Duration,
}

impl ModelTranslator {
    pub fn new(model: Arc<dyn TextModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }
}

#[async_trait]
impl Translator for ModelTranslator {
    async fn translate(&self, text: &str, target: Language, source: Option<Language>) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        if target == Language::Hu && looks_hungarian(text) {
            return text.to_string();
        }
        let prompt = translation_prompt(text, target, source);
        match complete_within(self.model.as_ref(), &prompt, TRANSLATE_MAX_TOKENS, self.timeout).await {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            Ok(_) => text.to_string(),
            Err(err) => {
                warn!(target_lang = %target, error = %err, "translation failed, keeping original");
                text.to_string()
            }
        }
    }
}

pub fn categorization_prompt(title: &str, description: Option<&str>) -> String {
    let description = description
        .filter(|d| !d.trim().is_empty())
        .map(|d| format!("Description: {d}\n"))
        .unwrap_or_default();
    format!(
        "Categorize this auction/insolvency item into exactly one category.\n\n\
         Categories:\n\
         - it: Servers, computers, IT equipment, networking hardware, GPUs, data center equipment, storage systems\n\
         - machines: Industrial machines, CNC, manufacturing equipment, tools, production lines, factory equipment\n\
         - vehicles: Cars, trucks, forklifts, construction vehicles, trailers, boats, motorcycles\n\
         - property: Real estate, buildings, land, warehouses, offices, apartments\n\
         - other: Everything else (furniture, inventory, office equipment, miscellaneous)\n\n\
         Item:\n\
         Title: {title}\n\
         {description}\n\
         Respond with only the category name (it/machines/vehicles/property/other). Nothing else."
    )
}

/// Exact category name first, then the first category named anywhere in the answer.
pub fn category_from_response(response: &str) -> Category {
    let answer = response.trim().to_lowercase();
    if let Ok(category) = answer.parse::<Category>() {
        return category;
    }
    Category::ALL
        .iter()
        .copied()
        .find(|c| answer.contains(c.as_str()))
        .unwrap_or(Category::Other)
}

pub struct ModelCategorizer {
    model: Arc<dyn TextModel>,
    timeout: Duration,
}

impl ModelCategorizer {
    pub fn new(model: Arc<dyn TextModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }
}

#[async_trait]
impl Categorizer for ModelCategorizer {
    async fn categorize(&self, title: &str, description: Option<&str>) -> Category {
        if title.trim().is_empty() {
            return Category::Other;
        }
        let prompt = categorization_prompt(title, description);
        match complete_within(self.model.as_ref(), &prompt, CATEGORIZE_MAX_TOKENS, self.timeout).await {
            Ok(answer) => category_from_response(&answer),
            Err(err) => {
                warn!(error = %err, "categorization failed, using other");
                Category::Other
            }
        }
    }
}

/// Fills the translated fields and category of a freshly scraped deal.
///
/// Hungarian listings get English translations; German and Austrian listings get
/// Hungarian and English ones and keep their original title as `title_de`.
pub async fn enrich_listing(deal: NewDeal, translator: &dyn Translator, categorizer: &dyn Categorizer) -> NewDeal {
    let title = deal.title_original.clone();
    let description = deal
        .description_original
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .map(|d| truncate_chars(d, DESCRIPTION_TRANSLATE_CHARS).to_string());

    let mut t = Translations {
        title_hu: Some(title.clone()),
        title_en: Some(title.clone()),
        title_de: None,
        description_hu: deal.description_original.clone(),
        description_en: deal.description_original.clone(),
    };

    match deal.country {
        Country::Hu => {
            let from = Some(Language::Hu);
            t.title_en = Some(translator.translate(&title, Language::En, from).await);
            if let Some(desc) = &description {
                t.description_en = Some(translator.translate(desc, Language::En, from).await);
            }
        }
        Country::De | Country::At => {
            let from = Some(Language::De);
            t.title_hu = Some(translator.translate(&title, Language::Hu, from).await);
            t.title_en = Some(translator.translate(&title, Language::En, from).await);
            t.title_de = Some(title.clone());
            if let Some(desc) = &description {
                t.description_hu = Some(translator.translate(desc, Language::Hu, from).await);
                t.description_en = Some(translator.translate(desc, Language::En, from).await);
            }
        }
    }

    let category = categorizer
        .categorize(&title, deal.description_original.as_deref())
        .await;
    deal.with_translations(t).with_category(category)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dealspy_adapters::ModelError;
    use dealspy_core::{ScrapedListing, Source};
    use std::sync::Mutex;

    /// Tags text with its target language so tests can see which translations ran.
    pub(crate) struct TaggingTranslator;

    #[async_trait]
    impl Translator for TaggingTranslator {
        async fn translate(&self, text: &str, target: Language, _source: Option<Language>) -> String {
            format!("[{target}] {text}")
        }
    }

    struct CannedModel {
        answer: Result<String, ()>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedModel {
        fn new(answer: Result<&str, ()>) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(str::to_string),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextModel for CannedModel {
        async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer.clone().map_err(|_| ModelError::EmptyResponse)
        }
    }

    fn listing(country: Country, title: &str, description: Option<&str>) -> NewDeal {
        let mut l = ScrapedListing::new(Source::Netbid, "1", title, "https://deals.test/1", country);
        l.description = description.map(str::to_string);
        NewDeal::from_listing(l)
    }

    #[tokio::test]
    async fn hungarian_listing_is_translated_to_english_only() {
        let deal = listing(Country::Hu, "Szerver állvány", Some("Leírás"));
        let out = enrich_listing(deal, &TaggingTranslator, &FixedCategorizer(Category::It)).await;
        assert_eq!(out.title_hu.as_deref(), Some("Szerver állvány"));
        assert_eq!(out.title_en.as_deref(), Some("[en] Szerver állvány"));
        assert_eq!(out.title_de, None);
        assert_eq!(out.description_hu.as_deref(), Some("Leírás"));
        assert_eq!(out.description_en.as_deref(), Some("[en] Leírás"));
        assert_eq!(out.category, Some(Category::It));
    }

    #[tokio::test]
    async fn german_listing_keeps_original_as_title_de() {
        let long = "x".repeat(300);
        let deal = listing(Country::At, "Gabelstapler", Some(&long));
        let out = enrich_listing(deal, &TaggingTranslator, &FixedCategorizer::default()).await;
        assert_eq!(out.title_hu.as_deref(), Some("[hu] Gabelstapler"));
        assert_eq!(out.title_en.as_deref(), Some("[en] Gabelstapler"));
        assert_eq!(out.title_de.as_deref(), Some("Gabelstapler"));
        assert_eq!(out.description_en.unwrap().len(), "[en] ".len() + DESCRIPTION_TRANSLATE_CHARS);
        assert_eq!(out.description_original.as_deref(), Some(long.as_str()));
        assert_eq!(out.category, Some(Category::Other));
    }

    #[tokio::test]
    async fn model_translator_returns_original_on_failure() {
        let t = ModelTranslator::new(CannedModel::new(Err(())), DEFAULT_MODEL_TIMEOUT);
        assert_eq!(t.translate("Drehbank", Language::En, Some(Language::De)).await, "Drehbank");
    }

    #[tokio::test]
    async fn empty_text_skips_the_model() {
        let model = CannedModel::new(Ok("should not be used"));
        let t = ModelTranslator::new(model.clone(), DEFAULT_MODEL_TIMEOUT);
        assert_eq!(t.translate("  ", Language::En, None).await, "  ");
        assert_eq!(t.translate("Eladó ház", Language::Hu, None).await, "Eladó ház");
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_translator_trims_answer_and_names_languages() {
        let model = CannedModel::new(Ok("  Lathe \n"));
        let t = ModelTranslator::new(model.clone(), DEFAULT_MODEL_TIMEOUT);
        assert_eq!(t.translate("Drehbank", Language::En, Some(Language::De)).await, "Lathe");
        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("from German to English"));
        assert!(prompt.ends_with("Drehbank"));
    }

    #[test]
    fn category_response_matching() {
        assert_eq!(category_from_response("Vehicles"), Category::Vehicles);
        assert_eq!(category_from_response("Category: property."), Category::Property);
        assert_eq!(category_from_response("no idea"), Category::Other);
    }

    #[tokio::test]
    async fn categorizer_falls_back_to_other() {
        let failing = ModelCategorizer::new(CannedModel::new(Err(())), DEFAULT_MODEL_TIMEOUT);
        assert_eq!(failing.categorize("CNC Fräse", None).await, Category::Other);

        let model = CannedModel::new(Ok("machines"));
        let ok = ModelCategorizer::new(model.clone(), DEFAULT_MODEL_TIMEOUT);
        assert_eq!(ok.categorize("", None).await, Category::Other);
        assert_eq!(ok.categorize("CNC Fräse", Some("5 Achsen")).await, Category::Machines);
        assert!(model.prompts.lock().unwrap()[0].contains("Description: 5 Achsen"));
    }
}
