// 📋 Listing Readers - universe listings and index composition snapshots
//
// Both arrive as CSV exports from the exchange / index provider. The HTTP
// download and any Shift_JIS -> UTF-8 conversion happen before these readers
// see the bytes.
//
// Universe listing columns:   コード, 銘柄名, 市場・商品区分, 33業種区分, 17業種区分
// Index composition columns:  コード, 銘柄名 (or 名称)
// English aliases (code, name, market_segment, sector_33, sector_17) work too.

use crate::differ::IndexSnapshot;
use crate::entities::{SecurityCode, SecurityUpdate};
use crate::error::{MalformedInput, Result};
use crate::normalize::normalize;
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Placeholder stored when a classification cell is blank
pub const MISSING_CLASSIFICATION: &str = "-";

/// Rows in index files that carry the provider's copyright notice
const BOILERPLATE_MARKERS: &[&str] = &["著作物", "複写", "複製", "転載"];

// ============================================================================
// COLUMN RESOLUTION
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Column {
    canonical: &'static str,
    aliases: &'static [&'static str],
}

const CODE: Column = Column {
    canonical: "コード",
    aliases: &["コード", "code"],
};
const NAME: Column = Column {
    canonical: "銘柄名",
    aliases: &["銘柄名", "名称", "name"],
};
const SEGMENT: Column = Column {
    canonical: "市場・商品区分",
    aliases: &["市場・商品区分", "market_segment"],
};
const SECTOR_33: Column = Column {
    canonical: "33業種区分",
    aliases: &["33業種区分", "sector_33"],
};
const SECTOR_17: Column = Column {
    canonical: "17業種区分",
    aliases: &["17業種区分", "sector_17"],
};

struct HeaderMap(HashMap<String, usize>);

impl HeaderMap {
    fn new(headers: &StringRecord) -> Self {
        let map = headers
            .iter()
            .enumerate()
            .map(|(idx, h)| (normalize(h).to_lowercase(), idx))
            .collect();
        HeaderMap(map)
    }

    fn find(&self, column: Column) -> Option<usize> {
        column
            .aliases
            .iter()
            .find_map(|alias| self.0.get(&alias.to_lowercase()).copied())
    }

    fn require(&self, columns: &[Column]) -> Result<Vec<usize>> {
        let mut found = Vec::with_capacity(columns.len());
        let mut missing = Vec::new();

        for column in columns {
            match self.find(*column) {
                Some(idx) => found.push(idx),
                None => missing.push(column.canonical.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(MalformedInput::MissingColumns(missing).into());
        }
        Ok(found)
    }
}

fn cell<'r>(record: &'r StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or("").trim()
}

fn classification(raw: &str) -> String {
    let value = normalize(raw);
    if value.is_empty() {
        MISSING_CLASSIFICATION.to_string()
    } else {
        value
    }
}

// ============================================================================
// UNIVERSE LISTING
// ============================================================================

pub fn read_universe_listing(path: &Path) -> Result<Vec<SecurityUpdate>> {
    let file = File::open(path)?;
    let listing = parse_universe_listing(file)?;
    info!(path = %path.display(), securities = listing.len(), "read universe listing");
    Ok(listing)
}

/// Parse a full universe listing. Missing required columns abort the whole
/// listing; rows with unusable codes are skipped.
pub fn parse_universe_listing<R: Read>(reader: R) -> Result<Vec<SecurityUpdate>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = HeaderMap::new(rdr.headers()?);
    let cols = headers.require(&[CODE, NAME, SEGMENT, SECTOR_33, SECTOR_17])?;
    let (code_idx, name_idx, segment_idx, s33_idx, s17_idx) =
        (cols[0], cols[1], cols[2], cols[3], cols[4]);

    let mut listing = Vec::new();
    let mut skipped = 0usize;

    for (line_num, result) in rdr.records().enumerate() {
        let record = result?;
        let raw_code = cell(&record, code_idx);

        let code = match SecurityCode::from_exchange_code(raw_code) {
            Ok(code) => code,
            Err(_) => {
                // +2 because: 1-indexed + header row
                debug!(line = line_num + 2, raw_code, "skipping row without a usable code");
                skipped += 1;
                continue;
            }
        };

        listing.push(SecurityUpdate {
            code: code.to_string(),
            name: Some(normalize(cell(&record, name_idx))),
            market_segment: Some(classification(cell(&record, segment_idx))),
            sector_33: Some(classification(cell(&record, s33_idx))),
            sector_17: Some(classification(cell(&record, s17_idx))),
        });
    }

    if skipped > 0 {
        warn!(skipped, "universe listing rows skipped");
    }

    Ok(listing)
}

// ============================================================================
// INDEX COMPOSITION
// ============================================================================

pub fn read_index_snapshot(path: &Path, index: &str, as_of: NaiveDate) -> Result<IndexSnapshot> {
    let file = File::open(path)?;
    let members = parse_index_members(file)?;
    info!(path = %path.display(), index, %as_of, members = members.len(), "read index composition");
    Ok(IndexSnapshot::new(index, as_of, members))
}

/// Parse the member codes of an index composition file. Non-numeric rows
/// and copyright boilerplate rows are dropped.
pub fn parse_index_members<R: Read>(reader: R) -> Result<BTreeSet<SecurityCode>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = HeaderMap::new(rdr.headers()?);
    let code_idx = headers.require(&[CODE])?[0];
    let name_idx = headers.find(NAME);

    let mut members = BTreeSet::new();
    for result in rdr.records() {
        let record = result?;

        if let Some(idx) = name_idx {
            let name = cell(&record, idx);
            if name.is_empty() || BOILERPLATE_MARKERS.iter().any(|m| name.contains(m)) {
                continue;
            }
        }

        let raw_code = normalize(cell(&record, code_idx));
        let numeric = raw_code.trim_end_matches(".0");
        if numeric.is_empty() || !numeric.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        match SecurityCode::from_exchange_code(numeric) {
            Ok(code) => {
                members.insert(code);
            }
            Err(e) => debug!(error = %e, "dropping index row"),
        }
    }

    Ok(members)
}

/// Parse a `YYYY-MM-DD` date argument
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| MalformedInput::InvalidDate(raw.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SentinelError;
    use pretty_assertions::assert_eq;

    const JPX_SAMPLE: &str = "\
日付,コード,銘柄名,市場・商品区分,33業種コード,33業種区分,17業種コード,17業種区分,規模コード,規模区分
20240430,1301,極洋,プライム（内国株式）,50,水産・農林業,1,食品 ,7,TOPIX Small 2
20240430,130A,Ｖｅｒｉｔａｓ\u{3000}Ｉｎ\u{3000}Ｓｉｌｉｃｏ,グロース（内国株式）,5250,情報・通信業,10,情報通信・サービスその他 ,-,-
20240430,1305,ｉＦｒｅｅＥＴＦ　ＴＯＰＩＸ,ETF・ETN,,,,,,
20240430,,空行,,,,,,,
";

    #[test]
    fn test_parse_jpx_listing() {
        let listing = parse_universe_listing(JPX_SAMPLE.as_bytes()).unwrap();

        assert_eq!(listing.len(), 3);
        assert_eq!(listing[0].code, "1301.T");
        assert_eq!(listing[0].name.as_deref(), Some("極洋"));
        assert_eq!(listing[0].market_segment.as_deref(), Some("プライム(内国株式)"));
        assert_eq!(listing[0].sector_17.as_deref(), Some("食品"));

        assert_eq!(listing[1].code, "130A.T");
        assert_eq!(listing[1].name.as_deref(), Some("Veritas In Silico"));

        // ETFs carry no sector classification
        assert_eq!(listing[2].sector_33.as_deref(), Some(MISSING_CLASSIFICATION));
        assert_eq!(listing[2].name.as_deref(), Some("iFreeETF TOPIX"));
    }

    #[test]
    fn test_english_headers_accepted() {
        let csv = "code,name,market_segment,sector_33,sector_17\n7203,Toyota,Prime,Transport,Auto\n";
        let listing = parse_universe_listing(csv.as_bytes()).unwrap();
        assert_eq!(listing[0].code, "7203.T");
    }

    #[test]
    fn test_missing_columns_abort() {
        let csv = "コード,銘柄名\n7203,トヨタ\n";
        let err = parse_universe_listing(csv.as_bytes()).unwrap_err();

        match err {
            SentinelError::Malformed(MalformedInput::MissingColumns(cols)) => {
                assert_eq!(cols, vec!["市場・商品区分", "33業種区分", "17業種区分"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_nikkei_members_drops_boilerplate() {
        let csv = "\
コード,銘柄名,社名,業種
7203,トヨタ自動車,トヨタ自動車(株),自動車
6758,ソニーグループ,ソニーグループ(株),電気機器
9984.0,ソフトバンクグループ,ソフトバンクグループ(株),通信
,本資料の著作物に関する一切の権利は日本経済新聞社に帰属します,,
注記,無断での複写・転載を禁じます,,
";
        let members = parse_index_members(csv.as_bytes()).unwrap();
        let codes: Vec<&str> = members.iter().map(|c| c.as_str()).collect();

        assert_eq!(codes, vec!["6758.T", "7203.T", "9984.T"]);
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-04-01").unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
        );
        assert!(parse_date("04/01/2024").unwrap_err().is_malformed());
    }
}
