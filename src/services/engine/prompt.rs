use std::path::Path;

use super::ExtractionContext;

/// Instruction sent with every image for the built-in promotion schema.
pub const PROMOTION_PROMPT: &str = concat!(
    "You will receive ONE product-promotion image. Return ONLY valid JSON with EXACTLY four keys:\n",
    "{\n",
    "  \"name\":       \"<product name, exactly as printed on the image>\",\n",
    "  \"price\":      <number OR null>,\n",
    "  \"promo\":      \"<ONE of: NONE, SUP, DISC, DEALPCT, DEALFIX, BXYG, PACK>\",\n",
    "  \"promo_args\": \"<see rules below>\"\n",
    "}\n\n",
    "promo / promo_args grammar (strict):\n",
    "- NONE    -> promo_args=\"\"\n",
    "- SUP     -> promo_args=\"\" OR N (integer >= 1)\n",
    "- DISC    -> promo_args=P (P in 0..100, number only)\n",
    "- DEALPCT -> promo_args=\"N:P\" (integers; e.g. \"3:27\", \"2:40\")\n",
    "- DEALFIX -> promo_args=\"N=price\" (e.g. \"2=1.00\")\n",
    "- BXYG    -> promo_args=\"X:Y\" (e.g. \"1:1\", \"4:2\")\n",
    "- PACK    -> ONE of the following tokens (no spaces):\n",
    "    \"N\" (price for ONE pack of N units, e.g. \"12\"),\n",
    "    \"N:P\" (% off when buying ONE N-pack, e.g. \"6:43\"),\n",
    "    \"AxB\" (deal over MULTIPLE packs, e.g. \"2x6\"),\n",
    "    \"AxB:P\" (% off on extra pack(s), e.g. \"2x6:50\"),\n",
    "    or several of these joined by \"|\" (e.g. \"2x6|12\"). \"|\" is allowed ONLY for PACK.\n\n",
    "Additional rules:\n",
    "- Use ONLY the 7 promo codes above. Never invent new codes.\n",
    "- If the ad shows NO numeric price, set \"price\": null. Never guess.\n",
    "- If both old and new prices are shown, use the discounted price.\n",
    "- Ignore unit prices (per kg, per l), dates and loyalty-card notes.\n",
    "- Use PACK only when the price or discount explicitly refers to a pack; \"X+Y free\" is BXYG even for packs.\n",
    "- Include pack size in \"name\" ONLY if it is printed next to the product name.\n",
    "- Use a dot for decimals (19.99). No % or currency symbols in numeric fields.\n",
    "- If several patterns match, prefer: BXYG > PACK > DEALFIX > DEALPCT > DISC > SUP > NONE.\n",
    "- Return JSON only: no markdown, no extra text."
);

/// Load a replacement instruction from a text file, or use the built-in one.
pub fn load_system_prompt(path: Option<&Path>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).map(|text| text.trim().to_string()),
        None => Ok(PROMOTION_PROMPT.to_string()),
    }
}

/// The user turn accompanying the image.
pub fn user_instruction(context: &ExtractionContext) -> String {
    let mut text = format!(
        "Extract the promotion details from this image. Product text is in {}; copy names exactly as printed.",
        context.language
    );
    if let Some((field, value)) = &context.hint {
        text.push_str(&format!(
            " The {field} is fixed to {value}: set \"{field}\": \"{value}\" and keep every other field consistent with it."
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(hint: Option<(&str, &str)>) -> ExtractionContext {
        ExtractionContext {
            language: "Polish".to_string(),
            max_output_tokens: 120,
            hint: hint.map(|(f, v)| (f.to_string(), v.to_string())),
        }
    }

    #[test]
    fn test_user_instruction_mentions_language() {
        let text = user_instruction(&context(None));
        assert!(text.contains("Polish"));
        assert!(!text.contains("fixed"));
    }

    #[test]
    fn test_user_instruction_fixes_hinted_field() {
        let text = user_instruction(&context(Some(("promo", "BXYG"))));
        assert!(text.contains("\"promo\": \"BXYG\""));
    }

    #[test]
    fn test_prompt_override_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "  Return {\"sku\": string}.\n").unwrap();
        assert_eq!(load_system_prompt(Some(&path)).unwrap(), "Return {\"sku\": string}.");
        assert_eq!(load_system_prompt(None).unwrap(), PROMOTION_PROMPT);
    }
}
