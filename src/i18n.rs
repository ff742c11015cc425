/*
Locale data backing the template renderer's formatting filters.

This module provides:
- Month name tables for date formatting (en / ar).
- The Western -> Arabic-Indic digit map used by the `arabic_number` filter.
- Number formatting separators per locale.
- Currency symbol lookup for `format_currency`.
- RTL detection; rendered output for RTL locales is wrapped in Unicode
  direction markers.

Notes:
- The locale argument everywhere is a short language code ("en", "ar").
  Unknown locales fall back to the default language.
*/

use std::collections::HashMap;
use std::sync::OnceLock;

pub const DEFAULT_LANG: &str = "en";

/// Unicode right-to-left embedding / pop directional formatting.
pub const RLE: char = '\u{202B}';
pub const PDF: char = '\u{202C}';

const MONTHS_EN: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const MONTHS_EN_SHORT: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const MONTHS_AR: [&str; 12] = [
    "يناير",
    "فبراير",
    "مارس",
    "أبريل",
    "مايو",
    "يونيو",
    "يوليو",
    "أغسطس",
    "سبتمبر",
    "أكتوبر",
    "نوفمبر",
    "ديسمبر",
];

static RTL_LANGS: OnceLock<Vec<&'static str>> = OnceLock::new();

fn rtl_langs() -> &'static [&'static str] {
    RTL_LANGS.get_or_init(|| vec!["ar", "he", "fa", "ur"])
}

pub fn is_rtl(locale: &str) -> bool {
    rtl_langs().contains(&normalize(locale))
}

fn normalize(locale: &str) -> &str {
    // "ar-EG" -> "ar"
    locale.split(['-', '_']).next().unwrap_or(DEFAULT_LANG)
}

/// Month name (1-based) for the given locale and style ("short" or anything else).
pub fn month_name(locale: &str, month: u32, short: bool) -> &'static str {
    let idx = (month.clamp(1, 12) - 1) as usize;
    match normalize(locale) {
        "ar" => MONTHS_AR[idx],
        _ if short => MONTHS_EN_SHORT[idx],
        _ => MONTHS_EN[idx],
    }
}

/// Map Western digits to Arabic-Indic digits; all other characters pass through.
pub fn arabic_digits(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '0' => '٠',
            '1' => '١',
            '2' => '٢',
            '3' => '٣',
            '4' => '٤',
            '5' => '٥',
            '6' => '٦',
            '7' => '٧',
            '8' => '٨',
            '9' => '٩',
            other => other,
        })
        .collect()
}

/// (thousands separator, decimal separator) for the locale.
pub fn number_separators(locale: &str) -> (char, char) {
    match normalize(locale) {
        "ar" => ('٬', '٫'),
        _ => (',', '.'),
    }
}

static CURRENCIES: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();

pub fn currency_symbol(code: &str) -> &'static str {
    let map = CURRENCIES.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("USD", "$");
        m.insert("EUR", "€");
        m.insert("GBP", "£");
        m.insert("EGP", "ج.م");
        m.insert("SAR", "ر.س");
        m.insert("AED", "د.إ");
        m
    });
    map.get(code).copied().unwrap_or("¤")
}

/// Wrap text in RTL embedding markers when the locale is right-to-left.
pub fn with_direction(locale: &str, text: String) -> String {
    if is_rtl(locale) && !text.is_empty() {
        format!("{}{}{}", RLE, text, PDF)
    } else {
        text
    }
}
