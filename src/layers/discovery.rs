use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use std::time::{Duration, Instant};

use crate::layers::planner::LinearQuery;
use crate::layers::Paper;

/// Remote search endpoint: one linear query in, one result set out.
#[async_trait]
pub trait PaperSource: Send + Sync {
    async fn search(&self, query: &LinearQuery) -> Result<Vec<Paper>>;

    /// `search` bounded by `budget` of request time. Sources that queue behind a
    /// rate limiter keep the queueing off the clock.
    async fn search_within(&self, query: &LinearQuery, budget: Duration) -> Result<Vec<Paper>> {
        match tokio::time::timeout(budget, self.search(query)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {:?}", budget)),
        }
    }
}

use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ArxivOptions {
    pub endpoint: String,
    pub timeout: Duration,
    pub page_size: usize,
    pub max_pages: usize,
    pub min_interval: Duration,
}

impl Default for ArxivOptions {
    fn default() -> Self {
        Self {
            endpoint: "http://export.arxiv.org/api/query".to_string(),
            timeout: Duration::from_secs(30),
            page_size: 100,
            max_pages: 10,
            min_interval: Duration::from_secs(3),
        }
    }
}

pub struct ArxivClient {
    client: Client,
    options: ArxivOptions,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ArxivClient {
    pub fn new(options: ArxivOptions) -> Result<Self> {
        // arXiv asks for no more than one request every three seconds
        let quota = Quota::with_period(options.min_interval)
            .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)));
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            options,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    fn page_url(&self, query: &LinearQuery, start: usize) -> String {
        format!(
            "{}?search_query={}&start={}&max_results={}&sortBy=submittedDate&sortOrder=descending",
            self.options.endpoint,
            urlencoding::encode(&query.to_arxiv()),
            start,
            self.options.page_size
        )
    }

    /// Waits for the limiter, then runs one request. Only the request itself is
    /// charged to `budget`.
    async fn fetch_page(&self, url: &str, budget: &mut Option<Duration>) -> Result<AtomPage> {
        self.limiter.until_ready().await;

        tracing::debug!("Querying arXiv: {}", url);
        let started = Instant::now();
        let page = match *budget {
            Some(left) => match tokio::time::timeout(left, self.exchange(url)).await {
                Ok(result) => result?,
                Err(_) => return Err(anyhow!("arXiv request budget spent after {:?}", started.elapsed())),
            },
            None => self.exchange(url).await?,
        };
        if let Some(left) = budget.as_mut() {
            *left = left.saturating_sub(started.elapsed());
        }
        Ok(page)
    }

    async fn exchange(&self, url: &str) -> Result<AtomPage> {
        match self.client.get(url).send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    return Err(anyhow!("arXiv API error: {}", resp.status()));
                }
                let text = resp.text().await?;
                parse_atom(&text)
            }
            Err(e) => Err(anyhow!("Request failed: {}", e)),
        }
    }

    async fn search_pages(&self, query: &LinearQuery, mut budget: Option<Duration>) -> Result<Vec<Paper>> {
        let pages = self.options.max_pages.max(1);
        let mut papers = Vec::new();
        for page in 0..pages {
            let start = page * self.options.page_size;
            let batch = self.fetch_page(&self.page_url(query, start), &mut budget).await?;
            let received = batch.papers.len();
            papers.extend(batch.papers);

            let left = unfetched(batch.total, start + received);
            if received < self.options.page_size || left == Some(0) {
                break;
            }
            if page + 1 == pages {
                if let Some(left) = left {
                    tracing::warn!(
                        "Stopped after {} pages with {} results still unfetched for {}",
                        pages,
                        left,
                        query
                    );
                }
            }
        }
        tracing::info!("arXiv returned {} papers for {}", papers.len(), query);
        Ok(papers)
    }
}

/// Results the feed reports beyond the first `fetched`, when it reports a total.
fn unfetched(total: Option<u64>, fetched: usize) -> Option<u64> {
    total.map(|total| total.saturating_sub(fetched as u64))
}

#[async_trait]
impl PaperSource for ArxivClient {
    async fn search(&self, query: &LinearQuery) -> Result<Vec<Paper>> {
        self.search_pages(query, None).await
    }

    async fn search_within(&self, query: &LinearQuery, budget: Duration) -> Result<Vec<Paper>> {
        self.search_pages(query, Some(budget)).await
    }
}

use quick_xml::events::Event;
use quick_xml::reader::Reader;

#[derive(Debug, Default)]
pub struct AtomPage {
    pub total: Option<u64>,
    pub papers: Vec<Paper>,
}

#[derive(Default)]
struct EntryDraft {
    id: String,
    title: String,
    summary: String,
    published: String,
    comment: String,
    authors: Vec<String>,
    categories: Vec<String>,
    pdf_url: Option<String>,
}

impl EntryDraft {
    fn finish(self) -> Result<Option<Paper>> {
        let id_url = normalize_ws(&self.id);
        if id_url.contains("/api/errors") {
            return Err(anyhow!("arXiv rejected the query: {}", normalize_ws(&self.summary)));
        }
        let Some(id) = arxiv_id_from_url(&id_url) else {
            tracing::warn!("Skipping arXiv entry without an id: '{}'", normalize_ws(&self.title));
            return Ok(None);
        };
        let Some(published) = parse_published(&self.published) else {
            tracing::warn!("Skipping arXiv entry {} with unparsable date '{}'", id, self.published);
            return Ok(None);
        };
        let comment = normalize_ws(&self.comment);

        Ok(Some(Paper {
            url: Some(format!("https://arxiv.org/abs/{}", id)),
            id,
            title: normalize_ws(&self.title),
            abstract_text: normalize_ws(&self.summary),
            categories: self.categories,
            published,
            authors: self.authors.iter().map(|a| normalize_ws(a)).collect(),
            pdf_url: self.pdf_url,
            comment: (!comment.is_empty()).then_some(comment),
        }))
    }
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `http://arxiv.org/abs/2410.01234v2` -> `2410.01234`, `http://arxiv.org/abs/cs/9901001v1` -> `cs/9901001`.
fn arxiv_id_from_url(url: &str) -> Option<String> {
    let at = url.rfind("/abs/")?;
    let tail = url[at + "/abs/".len()..].trim_matches('/');
    let id = match tail.rfind('v') {
        Some(v) if v > 0 && tail[v + 1..].chars().all(|c| c.is_ascii_digit()) && v + 1 < tail.len() => &tail[..v],
        _ => tail,
    };
    (!id.is_empty()).then(|| id.to_string())
}

fn parse_published(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc().date())
        .ok()
        .or_else(|| NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok())
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

#[derive(PartialEq)]
enum TagState {
    None,
    Title,
    Summary,
    Published,
    AuthorName,
    Id,
    Comment,
    Total,
}

pub fn parse_atom(text: &str) -> Result<AtomPage> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut page = AtomPage::default();
    let mut buf = Vec::new();
    let mut entry: Option<EntryDraft> = None;
    let mut total = String::new();
    let mut state = TagState::None;

    let on_text = |state: &TagState, entry: &mut Option<EntryDraft>, total: &mut String, txt: &str| {
        if *state == TagState::Total {
            total.push_str(txt);
            return;
        }
        let Some(draft) = entry.as_mut() else {
            return;
        };
        match state {
            TagState::Title => draft.title.push_str(txt),
            TagState::Summary => draft.summary.push_str(txt),
            TagState::Published => draft.published.push_str(txt),
            TagState::Id => draft.id.push_str(txt),
            TagState::Comment => draft.comment.push_str(txt),
            TagState::AuthorName => {
                if let Some(last) = draft.authors.last_mut() {
                    last.push_str(txt);
                }
            }
            _ => {}
        }
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let in_entry = entry.is_some();
                match e.name().as_ref() {
                    b"entry" => entry = Some(EntryDraft::default()),
                    b"opensearch:totalResults" => state = TagState::Total,
                    b"title" if in_entry => state = TagState::Title,
                    b"summary" if in_entry => state = TagState::Summary,
                    b"published" if in_entry => state = TagState::Published,
                    b"id" if in_entry => state = TagState::Id,
                    b"arxiv:comment" if in_entry => state = TagState::Comment,
                    b"name" if in_entry => {
                        if let Some(draft) = entry.as_mut() {
                            draft.authors.push(String::new());
                        }
                        state = TagState::AuthorName;
                    }
                    _ => state = TagState::None,
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(draft) = entry.as_mut() {
                    match e.name().as_ref() {
                        b"category" => {
                            if let Some(term) = attr(&e, b"term") {
                                draft.categories.push(term);
                            }
                        }
                        b"link" => {
                            let is_pdf = attr(&e, b"title").as_deref() == Some("pdf")
                                || attr(&e, b"type").as_deref() == Some("application/pdf");
                            if is_pdf {
                                draft.pdf_url = attr(&e, b"href");
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let txt = String::from_utf8_lossy(&e.into_inner()).into_owned();
                on_text(&state, &mut entry, &mut total, &txt);
            }
            Ok(Event::CData(e)) => {
                let txt = String::from_utf8_lossy(&e.into_inner()).into_owned();
                on_text(&state, &mut entry, &mut total, &txt);
            }
            Ok(Event::GeneralRef(e)) => {
                let name = String::from_utf8_lossy(&e).into_owned();
                let resolved = match name.strip_prefix('#') {
                    Some(code) => {
                        let value = match code.strip_prefix('x') {
                            Some(hex) => u32::from_str_radix(hex, 16).ok(),
                            None => code.parse().ok(),
                        };
                        value.and_then(char::from_u32).map(String::from)
                    }
                    None => quick_xml::escape::resolve_predefined_entity(&name).map(str::to_string),
                };
                if let Some(txt) = resolved {
                    on_text(&state, &mut entry, &mut total, &txt);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"entry" => {
                    if let Some(draft) = entry.take() {
                        if let Some(paper) = draft.finish()? {
                            tracing::debug!("Parsed arXiv entry: id='{}', title='{}'", paper.id, paper.title);
                            page.papers.push(paper);
                        }
                    }
                    state = TagState::None;
                }
                _ => state = TagState::None,
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow!(
                    "XML parsing error at position {}: {:?}",
                    reader.buffer_position(),
                    e
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    if entry.is_some() {
        return Err(anyhow!("truncated Atom feed: unterminated <entry>"));
    }
    page.total = total.trim().parse().ok();
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::date;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry(id: &str, title: &str, published: &str, categories: &[&str]) -> String {
        let cats: String = categories
            .iter()
            .map(|c| format!(r#"<category term="{}" scheme="http://arxiv.org/schemas/atom"/>"#, c))
            .collect();
        format!(
            r#"<entry>
    <id>http://arxiv.org/abs/{id}v1</id>
    <updated>{published}T17:59:59Z</updated>
    <published>{published}T17:59:59Z</published>
    <title>{title}</title>
    <summary>  We study agents &amp; tools.
    Across two lines.</summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <arxiv:comment xmlns:arxiv="http://arxiv.org/schemas/atom">12 pages</arxiv:comment>
    <link href="http://arxiv.org/abs/{id}v1" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/{id}v1" rel="related" type="application/pdf"/>
    <arxiv:primary_category xmlns:arxiv="http://arxiv.org/schemas/atom" term="{first}" scheme="http://arxiv.org/schemas/atom"/>
    {cats}
  </entry>"#,
            first = categories.first().copied().unwrap_or("cs.AI"),
        )
    }

    fn feed(total: usize, entries: &[String]) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="html">ArXiv Query: search_query=all:agent</title>
  <id>http://arxiv.org/api/abc</id>
  <opensearch:totalResults xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">{total}</opensearch:totalResults>
  {}
</feed>"#,
            entries.join("\n")
        )
    }

    #[test]
    fn test_parse_atom_entry() {
        let xml = feed(1, &[entry("2508.01234", "Agents\n   that Browse", "2025-08-26", &["cs.AI", "cs.CL"])]);
        let page = parse_atom(&xml).unwrap();
        assert_eq!(page.total, Some(1));
        assert_eq!(page.papers.len(), 1);
        let paper = &page.papers[0];
        assert_eq!(paper.id, "2508.01234");
        assert_eq!(paper.title, "Agents that Browse");
        assert_eq!(paper.abstract_text, "We study agents & tools. Across two lines.");
        assert_eq!(paper.categories, ["cs.AI", "cs.CL"]);
        assert_eq!(paper.published, date("2025-08-26"));
        assert_eq!(paper.authors, ["Ada Lovelace", "Alan Turing"]);
        assert_eq!(paper.pdf_url.as_deref(), Some("http://arxiv.org/pdf/2508.01234v1"));
        assert_eq!(paper.comment.as_deref(), Some("12 pages"));
    }

    #[test]
    fn test_parse_atom_error_entry() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
            <id>http://arxiv.org/api/errors#incorrect_id_format_for_1234</id>
            <title>Error</title>
            <summary>incorrect id format for 1234</summary>
        </entry></feed>"#;
        assert!(parse_atom(xml).is_err());
    }

    #[test]
    fn test_parse_atom_malformed() {
        assert!(parse_atom("<feed><entry><id>x</id>").is_err());
        assert!(parse_atom("<feed><entry></feed>").is_err());
    }

    #[test]
    fn test_arxiv_id_from_url() {
        assert_eq!(arxiv_id_from_url("http://arxiv.org/abs/2410.01234v2").as_deref(), Some("2410.01234"));
        assert_eq!(arxiv_id_from_url("http://arxiv.org/abs/cs/9901001v1").as_deref(), Some("cs/9901001"));
        assert_eq!(arxiv_id_from_url("http://arxiv.org/abs/2410.01234").as_deref(), Some("2410.01234"));
        assert_eq!(arxiv_id_from_url("http://example.com/nothing"), None);
    }

    fn options(server: &MockServer, page_size: usize, max_pages: usize) -> ArxivOptions {
        ArxivOptions {
            endpoint: format!("{}/api/query", server.uri()),
            timeout: Duration::from_secs(5),
            page_size,
            max_pages,
            min_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_search_pages_until_total() {
        let server = MockServer::start().await;
        let first: Vec<String> = (0..2)
            .map(|i| entry(&format!("2508.0000{}", i), "t", "2025-08-26", &["cs.AI"]))
            .collect();
        let second = vec![entry("2508.00002", "t", "2025-08-26", &["cs.AI"])];

        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("start", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed(3, &first)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/query"))
            .and(query_param("start", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed(3, &second)))
            .expect(1)
            .mount(&server)
            .await;

        let client = ArxivClient::new(options(&server, 2, 5)).unwrap();
        let papers = client.search(&LinearQuery::latest()).await.unwrap();
        assert_eq!(papers.len(), 3);
    }

    #[tokio::test]
    async fn test_search_sends_rendered_query() {
        let server = MockServer::start().await;
        let query = LinearQuery {
            head: Some("agent".to_string()),
            chain: Vec::new(),
            date: Some(date("2025-08-26")),
        };
        Mock::given(method("GET"))
            .and(query_param("search_query", query.to_arxiv().as_str()))
            .and(query_param("sortBy", "submittedDate"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed(0, &[])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ArxivClient::new(options(&server, 50, 3)).unwrap();
        assert!(client.search(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = ArxivClient::new(options(&server, 50, 3)).unwrap();
        assert!(client.search(&LinearQuery::latest()).await.is_err());
    }

    #[tokio::test]
    async fn test_search_stops_at_max_pages() {
        let server = MockServer::start().await;
        let full: Vec<String> = (0..2)
            .map(|i| entry(&format!("2508.0000{}", i), "t", "2025-08-26", &["cs.AI"]))
            .collect();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed(5, &full)))
            .expect(1)
            .mount(&server)
            .await;

        let client = ArxivClient::new(options(&server, 2, 1)).unwrap();
        let papers = client.search(&LinearQuery::latest()).await.unwrap();
        assert_eq!(papers.len(), 2);
    }

    #[test]
    fn test_unfetched() {
        assert_eq!(unfetched(Some(1200), 1000), Some(200));
        assert_eq!(unfetched(Some(3), 3), Some(0));
        assert_eq!(unfetched(Some(3), 4), Some(0));
        assert_eq!(unfetched(None, 100), None);
    }

    #[tokio::test]
    async fn test_rate_limit_wait_is_not_charged_to_budget() {
        let server = MockServer::start().await;
        let body = feed(1, &[entry("2508.00001", "t", "2025-08-26", &["cs.AI"])]);
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(5)
            .mount(&server)
            .await;

        let client = ArxivClient::new(ArxivOptions {
            min_interval: Duration::from_millis(200),
            ..options(&server, 10, 1)
        })
        .unwrap();
        let queries: Vec<LinearQuery> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|t| LinearQuery {
                head: Some(t.to_string()),
                chain: Vec::new(),
                date: Some(date("2025-08-26")),
            })
            .collect();

        // the last query queues for ~800ms, longer than its 300ms budget
        let results = futures_util::future::join_all(
            queries.iter().map(|q| client.search_within(q, Duration::from_millis(300))),
        )
        .await;
        for result in results {
            assert_eq!(result.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_slow_response_spends_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(feed(0, &[]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = ArxivClient::new(options(&server, 10, 1)).unwrap();
        let err = client
            .search_within(&LinearQuery::latest(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("budget"));
    }
}
