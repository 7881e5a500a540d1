use bf_core::Lead;

// Excel only detects UTF-8 (and so renders the Arabic headers) with a BOM.
const BOM: char = '\u{feff}';
const HEADERS: [&str; 6] = [
    "الاسم",
    "رقم الهاتف",
    "اسم الزميل",
    "رقم الزميل",
    "الحالة",
    "تاريخ التسجيل",
];

fn quoted(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Renders leads as a spreadsheet-ready CSV document.
pub fn leads_to_csv(leads: &[Lead]) -> String {
    let mut out = String::new();
    out.push(BOM);
    out.push_str(&HEADERS.join(","));
    for lead in leads {
        let row = [
            quoted(&lead.user_name),
            quoted(&lead.user_phone),
            quoted(&lead.friend_name),
            quoted(&lead.friend_phone),
            lead.status.to_string(),
            quoted(&lead.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ];
        out.push('\n');
        out.push_str(&row.join(","));
    }
    out
}
