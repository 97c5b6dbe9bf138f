//! Default prompts for OCR, translation and polishing.
//!
//! Every prompt lives here so behaviour changes are made in one place and
//! tests can inspect the text without a model. Callers override any of them
//! through [`crate::config::OcrConfig::prompt`] and the translation
//! config's `translation_prompt` / `polishing_prompt` fields.
//!
//! The OCR prompt fixes the heading convention (`w`, `w.x`, `w.x.y` section
//! numbers become Markdown headings). [`crate::segment`] in numbered mode
//! depends on it to find chunk boundaries.

/// OCR instructions for one page image.
///
/// `keywords` names the document's field so the model resolves jargon and
/// symbols correctly; an empty list omits the sentence.
pub fn ocr_prompt(keywords: &[String]) -> String {
    let field = if keywords.is_empty() {
        String::new()
    } else {
        format!(", which contains the field of {}", keywords.join(", "))
    };
    format!(
        r##"I need you to extract the content (OCR) from the image{field}. The requirements are as follows:
1. Reply using Markdown. Do not put the content in a single code block unless the image only contains code. Add Markdown markup where the text is formatted instead of wrapping everything in ``` fences.
2. Send only the extracted content and do not add any description. Even if the image has very little content or is blank, do not add anything. For a blank image, reply with a single space.
3. Most line breaks in the text are caused by the page width. Remove them: consecutive sentences must not be broken across lines.
4. Determine the level of each heading and add the matching number of "#" marks. Only lone lines beginning with w, w.x, w.x.y or w.x.y.z followed by a short text are headings, where w, x, y, z are numbers. The top of the page is not necessarily a heading."##
    )
}

/// Translation instructions; the chunk text follows on the next line.
pub fn translation_prompt(target_language: &str) -> String {
    format!(
        r#"Act as a translator. Translate the following content into {target_language}. Requirements:
1. Keep the original meaning and make the language fluent and academic. Translate technical terms accurately; the readers are native {target_language} scholars.
2. Reply concisely with the translation only. Do not add explanations, even if the content is empty. Do not reply with anything that is not a translation of the original."#
    )
}

/// Polishing instructions; the original and its translation follow.
pub fn polishing_prompt(target_language: &str) -> String {
    format!(
        r#"Act as an editor polishing a {target_language} translation by comparing it with the original. Requirements:
1. Make sure the translation is accurate and technical terms are used correctly.
2. The Markdown in the text may be malformed; fix it.
3. Reply with the polished text only. Do not add explanations, even if the content is empty. Do not reply with anything that is not the polished translation."#
    )
}

/// Full translation request text: instructions, then the chunk.
pub fn translation_request(prompt: &str, chunk: &str) -> String {
    format!("{prompt}\n{chunk}")
}

/// Full polishing request text: instructions, original, translation.
pub fn polishing_request(prompt: &str, original: &str, translation: &str) -> String {
    format!("{prompt}\nOriginal:\n{original}\nTranslation:\n{translation}")
}
