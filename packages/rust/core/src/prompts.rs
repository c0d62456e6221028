//! Prompt text and response schemas for every LLM task.

use serde_json::{Value, json};

use bookgen_discovery::SearchQuery;
use bookgen_shared::{ProjectSettings, SourceSummary, TopicRecord, format_order};

/// Source text beyond this many characters is not sent to the model.
const MAX_SOURCE_CHARS: usize = 60_000;

/// English name of an ISO 639-1 code, for prompts.
pub fn language_name(code: &str) -> &str {
    match code.to_lowercase().as_str() {
        "en" => "English",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        "nl" => "Dutch",
        "pt" => "Portuguese",
        "pl" => "Polish",
        "sv" => "Swedish",
        "da" => "Danish",
        _ => code,
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn book(s: &ProjectSettings) -> String {
    format!("\"{}\" by {}", s.title, s.author)
}

fn pretty(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// First web query for a book.
pub fn primary_search_query(s: &ProjectSettings) -> String {
    format!("{} {} book analysis", s.title, s.author)
}

pub fn search(query: &SearchQuery) -> String {
    format!(
        "Search the web for: {}\n\n\
         Return up to {} of the most relevant pages written in language '{}', \
         preferring sources from country '{}'. List one full URL per line and nothing else.",
        query.query, query.num_results, query.language, query.country
    )
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub fn analyse_source(s: &ProjectSettings, url: &str, text: &str) -> String {
    format!(
        "You are researching the book {book} for a long-form article.\n\n\
         Below is the text of the web page {url}. Identify the distinct content areas the page \
         covers about the book. For each, give a short name, a coverage rating from 0 to 10 \
         (10 = thorough, accurate, useful for the article) and notes on what it contains. \
         Also list interesting facts about the book, its author or its history found on the page.\n\n\
         PAGE TEXT:\n{text}",
        book = book(s),
        text = truncate_chars(text, MAX_SOURCE_CHARS),
    )
}

pub fn source_analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "content_analysis": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "content_name": {"type": "string"},
                        "coverage_rating": {"type": "number"},
                        "analysis_notes": {"type": "string"}
                    },
                    "required": ["content_name", "coverage_rating", "analysis_notes"],
                    "additionalProperties": false
                }
            },
            "interesting_facts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"fact": {"type": "string"}},
                    "required": ["fact"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["content_analysis", "interesting_facts"],
        "additionalProperties": false
    })
}

pub fn refine_queries(s: &ProjectSettings, count: usize, sources: &[SourceSummary]) -> String {
    format!(
        "We are collecting web sources for an in-depth article about the book {book}.\n\n\
         These content areas are already covered by the sources found so far:\n{sources}\n\n\
         Suggest {count} further web search queries that would find sources on aspects that are \
         missing or poorly covered.",
        book = book(s),
        sources = pretty(&sources),
    )
}

pub fn queries_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "queries": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["queries"],
        "additionalProperties": false
    })
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub fn synthesize_topics(s: &ProjectSettings, sources: &[SourceSummary]) -> String {
    format!(
        "Plan an article of about {words} words about the book {book}.\n\n\
         Here are the analysed sources, best first:\n{sources}\n\n\
         Split the article into topics. For each topic give its order (1, 2, 3, ...), a name, \
         notes on what the section must cover, a suggested word count and the URLs of the \
         sources it should draw from. The word counts should add up to the article length.",
        words = s.proposed_word_count,
        book = book(s),
        sources = pretty(&sources),
    )
}

pub fn topics_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "topics": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "order": {"type": "number"},
                        "topic_name": {"type": "string"},
                        "topic_notes": {"type": "string"},
                        "word_count": {"type": "number"},
                        "sources": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {"url": {"type": "string"}},
                                "required": ["url"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["order", "topic_name", "topic_notes", "word_count", "sources"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["topics"],
        "additionalProperties": false
    })
}

/// Outline of the planned article, as shown to the writing model.
pub fn article_structure(records: &[TopicRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|r| {
                json!({
                    "order": r.order,
                    "topic_name": r.name,
                    "topic_notes": r.notes,
                    "suggested_length": r.word_count,
                    "sources": r.sources,
                })
            })
            .collect(),
    )
}

pub fn write_draft(
    s: &ProjectSettings,
    topic: &TopicRecord,
    structure: &[TopicRecord],
    sources: &[(String, String)],
) -> String {
    let source_info: Vec<Value> = sources
        .iter()
        .map(|(url, text)| json!({"url": url, "text": truncate_chars(text, MAX_SOURCE_CHARS)}))
        .collect();
    format!(
        "You are writing one section of an article about the book {book}.\n\n\
         Article structure:\n{structure}\n\n\
         Write section {order}, \"{name}\", in about {words} words, in {language}. \
         It must cover: {notes}\n\n\
         Use Markdown with a level-two heading for the section title. \
         Base the text on these sources:\n{sources}",
        book = book(s),
        structure = pretty(&article_structure(structure)),
        order = format_order(topic.order),
        name = topic.name,
        words = topic.word_count,
        language = language_name(&s.language),
        notes = topic.notes,
        sources = pretty(&source_info),
    )
}

pub fn refine_topic(s: &ProjectSettings, topic: &TopicRecord, article: &str) -> String {
    format!(
        "Below is the full draft of an article about the book {book}.\n\n\
         Rewrite section {order}, \"{name}\", so it reads well in the context of the whole \
         article: remove repetition with other sections, smooth transitions and keep the facts. \
         Return only the rewritten section in Markdown.\n\n\
         ARTICLE DRAFT:\n{article}",
        book = book(s),
        order = format_order(topic.order),
        name = topic.name,
    )
}

pub fn enforce_language(s: &ProjectSettings, topic: &TopicRecord, text: &str) -> String {
    format!(
        "The following section \"{name}\" of an article about the book {book} must be written \
         entirely in {language}. Translate any passage that is not, keep everything else \
         unchanged and return only the section in Markdown.\n\n{text}",
        name = topic.name,
        book = book(s),
        language = language_name(&s.language),
    )
}

// ---------------------------------------------------------------------------
// Facts and lead-in
// ---------------------------------------------------------------------------

pub fn research_key_facts(s: &ProjectSettings) -> String {
    format!(
        "Find the key facts about the book {book}: when it was first published, its genres, \
         when the story takes place and its main themes. Cite your sources.",
        book = book(s),
    )
}

pub fn organize_key_facts(s: &ProjectSettings, research: &str) -> String {
    format!(
        "Organise these notes about the book {book} into the requested fields. \
         Leave a field empty when the notes do not support it.\n\n{research}",
        book = book(s),
    )
}

pub fn key_facts_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "first_published": {"type": "string"},
            "genres": {"type": "array", "items": {"type": "string"}},
            "temporal_setting": {"type": "string"},
            "main_themes": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["first_published", "genres", "temporal_setting", "main_themes"],
        "additionalProperties": false
    })
}

pub fn synthesize_facts(s: &ProjectSettings, facts: &[String]) -> String {
    format!(
        "These facts about the book {book} were collected from many web pages:\n{facts}\n\n\
         Merge duplicates, drop anything doubtful and return the most interesting facts, \
         each as one sentence in {language}.",
        book = book(s),
        facts = pretty(&facts),
        language = language_name(&s.language),
    )
}

pub fn interesting_facts_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "interesting_facts": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["interesting_facts"],
        "additionalProperties": false
    })
}

pub fn write_lead_in(s: &ProjectSettings, article: &str) -> String {
    format!(
        "Write a short lead-in paragraph (two to four sentences, in {language}) that opens the \
         following article about the book {book} and makes the reader want to continue. \
         Return only the paragraph.\n\n{article}",
        language = language_name(&s.language),
        book = book(s),
    )
}

// ---------------------------------------------------------------------------
// Audiobooks
// ---------------------------------------------------------------------------

pub fn judge_listing(s: &ProjectSettings, url: &str, information: &Value) -> String {
    format!(
        "Is the audiobook listing {url} an edition of the book {book}? Adaptations, summaries, \
         study guides and other books by the same author do not count.\n\n{information}",
        book = book(s),
        information = pretty(information),
    )
}

pub fn judge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"is_correct_product": {"type": "boolean"}},
        "required": ["is_correct_product"],
        "additionalProperties": false
    })
}

pub fn describe_audiobooks(s: &ProjectSettings, products: &Value, article: &str) -> String {
    format!(
        "Here are audiobook editions of the book {book}:\n{products}\n\n\
         For each edition write a short description in {language} for readers of the article \
         below: what makes this edition (narration, length, abridgement, reviews) worth \
         listening to. Identify each edition by its ASIN.\n\nARTICLE:\n{article}",
        book = book(s),
        products = pretty(products),
        language = language_name(&s.language),
    )
}

pub fn descriptions_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "audible_products": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "asin": {"type": "string"},
                        "description": {"type": "string"}
                    },
                    "required": ["asin", "description"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["audible_products"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("Müller", 2), "Mü");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn draft_prompt_names_section_and_language() {
        let mut settings = ProjectSettings::new("Dune", "Frank Herbert");
        settings.language = "de".into();
        let topic = TopicRecord {
            order: 2.0,
            name: "Ecology".into(),
            notes: "Arrakis and water".into(),
            word_count: 400,
            sources: vec!["https://a.org".into()],
        };
        let prompt = write_draft(
            &settings,
            &topic,
            std::slice::from_ref(&topic),
            &[("https://a.org".into(), "Sand.".into())],
        );
        assert!(prompt.contains("section 2, \"Ecology\""));
        assert!(prompt.contains("in German"));
        assert!(prompt.contains("Sand."));
    }
}
