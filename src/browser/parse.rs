//! Text normalisation for scraped product and confirmation pages.

use chrono::{Datelike, Duration, Months, NaiveDate};

/// Folds full-width digits and separators to ASCII and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| match c {
            '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
            '，' => ',',
            '．' => '.',
            '／' => '/',
            _ => c,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First amount in `text`. A trailing group of exactly three digits after the
/// only separator kind present is a thousands group; when both `,` and `.`
/// appear the last one is the decimal point.
pub fn parse_price(text: &str) -> Option<f64> {
    let text = normalize_text(text);
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    let run = run.trim_end_matches([',', '.']);

    let last_comma = run.rfind(',');
    let last_dot = run.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => run.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => run.replace(',', ""),
        (Some(c), None) => {
            let decimals = run.len() - c - 1;
            if decimals == 3 || run.matches(',').count() > 1 {
                run.replace(',', "")
            } else {
                run.replace(',', ".")
            }
        }
        (None, Some(_)) if run.matches('.').count() > 1 => run.replace('.', ""),
        _ => run.to_string(),
    };
    normalized.parse().ok()
}

pub fn detect_currency(text: &str) -> Option<&'static str> {
    const MARKERS: &[(&str, &str)] = &[
        ("JPY", "JPY"),
        ("￥", "JPY"),
        ("¥", "JPY"),
        ("円", "JPY"),
        ("NT$", "TWD"),
        ("S$", "SGD"),
        ("US$", "USD"),
        ("RM", "MYR"),
        ("€", "EUR"),
        ("£", "GBP"),
        ("฿", "THB"),
        ("₱", "PHP"),
        ("₫", "VND"),
        ("$", "USD"),
    ];
    MARKERS
        .iter()
        .find(|(marker, _)| text.contains(marker))
        .map(|(_, code)| *code)
}

/// Availability is an allow-list: text that matches nothing affirmative is
/// treated as unavailable, and negative phrases win over affirmative ones.
pub fn is_affirmative_availability(text: &str, affirmative: &[String], negative: &[String]) -> bool {
    let text = normalize_text(text).to_lowercase();
    if negative.iter().any(|phrase| text.contains(&phrase.to_lowercase())) {
        return false;
    }
    affirmative
        .iter()
        .any(|phrase| text.contains(&phrase.to_lowercase()))
}

/// A condition label mentioning a used marker means the buy box only offers
/// a used copy. No label at all is the standard new-item buy box.
pub fn is_new_condition(condition: Option<&str>, used_markers: &[String]) -> bool {
    let Some(condition) = condition else {
        return true;
    };
    let condition = condition.to_lowercase();
    let is_used = used_markers.iter().any(|marker| {
        let marker = marker.to_lowercase();
        if marker.is_ascii() {
            condition
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == marker)
        } else {
            condition.contains(&marker)
        }
    });
    !is_used
}

pub fn parse_points(text: &str) -> Option<f64> {
    parse_price(text).filter(|points| *points >= 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Year(i32),
    Month(u32),
    Day(u32),
    Num(u32),
    Relative(i64),
    Word,
}

fn month_from_word(word: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    if word.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|name| name.starts_with(word))
        .map(|index| index as u32 + 1)
}

fn tokenize(text: &str) -> Vec<Token> {
    let chars: Vec<char> = normalize_text(text).chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let digits: String = chars[start..i].iter().collect();
            let Ok(n) = digits.parse::<u32>() else {
                continue;
            };
            match chars.get(i) {
                Some('年') => {
                    tokens.push(Token::Year(n as i32));
                    i += 1;
                }
                Some('月') => {
                    tokens.push(Token::Month(n));
                    i += 1;
                }
                Some('日') => {
                    tokens.push(Token::Day(n));
                    i += 1;
                }
                _ => tokens.push(Token::Num(n)),
            }
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
                i += 1;
            }
            let word = chars[start..i].iter().collect::<String>().to_lowercase();
            match word.as_str() {
                "today" => tokens.push(Token::Relative(0)),
                "tomorrow" => tokens.push(Token::Relative(1)),
                // Connectives keep "October 18 to 21" one range.
                "to" | "and" | "or" => {}
                _ => tokens.push(match month_from_word(&word) {
                    Some(month) => Token::Month(month),
                    None => Token::Word,
                }),
            }
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            match rest.as_str() {
                "明日" => {
                    tokens.push(Token::Relative(1));
                    i += 2;
                }
                "今日" | "本日" => {
                    tokens.push(Token::Relative(0));
                    i += 2;
                }
                _ => i += 1,
            }
        }
    }
    tokens
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mention {
    Date {
        year: Option<i32>,
        month: Option<u32>,
        day: u32,
    },
    Relative(i64),
}

fn mentions(tokens: &[Token]) -> Vec<Mention> {
    let mut found = Vec::new();
    let mut year = None;
    let mut month = None;
    let mut previous_was_date = false;
    let mut consumed = vec![false; tokens.len()];
    for (index, token) in tokens.iter().enumerate() {
        if consumed[index] {
            continue;
        }
        let is_date = match *token {
            Token::Year(y) => {
                year = Some(y);
                false
            }
            Token::Month(m) => {
                month = Some(m);
                match tokens.get(index + 1) {
                    // "October 18"
                    Some(Token::Num(day)) if (1..=31).contains(day) => {
                        consumed[index + 1] = true;
                        found.push(Mention::Date { year, month, day: *day });
                        true
                    }
                    _ => false,
                }
            }
            Token::Day(day) => {
                found.push(Mention::Date { year, month, day });
                true
            }
            Token::Num(day) if (1..=31).contains(&day) => {
                if let Some(Token::Month(m)) = tokens.get(index + 1) {
                    // "18 October"
                    month = Some(*m);
                    consumed[index + 1] = true;
                    found.push(Mention::Date { year, month, day });
                    true
                } else if previous_was_date && month.is_some() {
                    // "October 18 - 20"
                    found.push(Mention::Date { year, month, day });
                    true
                } else {
                    false
                }
            }
            Token::Num(_) | Token::Word => false,
            Token::Relative(days) => {
                found.push(Mention::Relative(days));
                true
            }
        };
        previous_was_date = is_date;
    }
    found
}

fn resolve(mention: Mention, today: NaiveDate) -> Option<NaiveDate> {
    match mention {
        Mention::Relative(days) => today.checked_add_signed(Duration::days(days)),
        Mention::Date {
            year: Some(year),
            month: Some(month),
            day,
        } => NaiveDate::from_ymd_opt(year, month, day),
        Mention::Date {
            year: None,
            month: Some(month),
            day,
        } => {
            let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
            if this_year < today {
                NaiveDate::from_ymd_opt(today.year() + 1, month, day)
            } else {
                Some(this_year)
            }
        }
        Mention::Date { month: None, day, .. } => {
            let first = today.with_day(1)?;
            let this_month = first.with_day(day);
            match this_month {
                Some(date) if date >= today => Some(date),
                _ => first.checked_add_months(Months::new(1))?.with_day(day),
            }
        }
    }
}

/// Latest date mentioned in a delivery message. Ranges resolve to their end
/// so the shipping estimate stays conservative. Dates without a year roll
/// into next year once passed; a bare day rolls into next month.
pub fn parse_delivery_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    mentions(&tokenize(text))
        .into_iter()
        .filter_map(|mention| resolve(mention, today))
        .max()
}

/// Amazon order numbers look like `503-1234567-7654321`.
pub fn extract_order_id(text: &str) -> Option<String> {
    const GROUPS: [usize; 3] = [3, 7, 7];
    let bytes = text.as_bytes();
    let total = GROUPS.iter().sum::<usize>() + GROUPS.len() - 1;
    if bytes.len() < total {
        return None;
    }
    'scan: for start in 0..=bytes.len() - total {
        if start > 0 && bytes[start - 1].is_ascii_digit() {
            continue;
        }
        let mut pos = start;
        for (group_index, len) in GROUPS.iter().enumerate() {
            if group_index > 0 {
                if bytes[pos] != b'-' {
                    continue 'scan;
                }
                pos += 1;
            }
            if !bytes[pos..pos + len].iter().all(u8::is_ascii_digit) {
                continue 'scan;
            }
            pos += len;
        }
        if bytes.get(pos).is_some_and(u8::is_ascii_digit) {
            continue;
        }
        return Some(text[start..pos].to_string());
    }
    None
}

/// Extra characters an address option may carry beyond the configured label
/// (name prefix, postcode) and still count as the same address.
pub const ADDRESS_MATCH_SLACK: usize = 20;

/// Index of the address option matching `label`: an exact match on the
/// whole option or its first line wins, then a near match that contains the
/// label with little else around it. Nothing else is accepted.
pub fn match_address(options: &[String], label: &str) -> Option<usize> {
    let label = normalize_text(label);
    if label.is_empty() {
        return None;
    }
    let exact = options.iter().position(|option| {
        let first_line = option
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        normalize_text(option) == label || normalize_text(first_line) == label
    });
    if exact.is_some() {
        return exact;
    }
    let label_len = label.chars().count();
    options.iter().position(|option| {
        let text = normalize_text(option);
        text.contains(&label) && text.chars().count() - label_len <= ADDRESS_MATCH_SLACK
    })
}
