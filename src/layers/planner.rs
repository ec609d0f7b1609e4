use std::fmt;

use chrono::NaiveDate;

use crate::layers::condition::ConditionModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
        }
    }
}

/// A chain `t0 OP1 t1 OP2 t2 ...` evaluated strictly left to right, without grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearQuery {
    pub head: Option<String>,
    pub chain: Vec<(Operator, String)>,
    pub date: Option<NaiveDate>,
}

impl LinearQuery {
    pub fn latest() -> Self {
        Self {
            head: None,
            chain: Vec::new(),
            date: None,
        }
    }

    pub fn on(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    /// Evaluates the chain against a text the way the remote engine does.
    pub fn matches_text(&self, text: &str) -> bool {
        let haystack = text.to_lowercase();
        let hit = |term: &str| haystack.contains(&term.to_lowercase());
        let Some(head) = &self.head else {
            return true;
        };
        self.chain
            .iter()
            .fold(hit(head), |acc, (op, term)| match op {
                Operator::And => acc && hit(term),
                Operator::Or => acc || hit(term),
            })
    }

    /// arXiv `search_query` form. Parentheses are nested to the left so the
    /// engine evaluates the chain in order.
    pub fn to_arxiv(&self) -> String {
        let expr = match &self.head {
            None => "cat:cs.*".to_string(),
            Some(head) => self.chain.iter().fold(field(head), |acc, (op, term)| {
                format!("({} {} {})", acc, op.as_str(), field(term))
            }),
        };
        match self.date {
            Some(date) => {
                let day = date.format("%Y%m%d");
                format!("{} AND submittedDate:[{}0000 TO {}2359]", wrap(&expr), day, day)
            }
            None => expr,
        }
    }
}

impl fmt::Display for LinearQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_arxiv())
    }
}

fn field(term: &str) -> String {
    let term = term.replace('"', "");
    if term.contains(char::is_whitespace) {
        format!("all:\"{}\"", term)
    } else {
        format!("all:{}", term)
    }
}

fn wrap(expr: &str) -> String {
    if expr.starts_with('(') {
        expr.to_string()
    } else {
        format!("({})", expr)
    }
}

pub struct Planner;

impl Planner {
    /// One query per term of the smallest clause; every other clause is chained in
    /// as `AND first OR second OR ...`. The union of the results is a superset of
    /// the papers satisfying `model`.
    pub fn plan(model: &ConditionModel) -> Vec<LinearQuery> {
        let clauses: Vec<_> = model.clauses().collect();
        let Some((pivot_index, pivot)) = clauses
            .iter()
            .enumerate()
            .min_by_key(|(i, clause)| (clause.len(), *i))
        else {
            return vec![LinearQuery::latest()];
        };

        let mut tail = Vec::new();
        for (i, clause) in clauses.iter().enumerate() {
            if i == pivot_index {
                continue;
            }
            for (j, term) in clause.terms().iter().enumerate() {
                let op = if j == 0 { Operator::And } else { Operator::Or };
                tail.push((op, term.clone()));
            }
        }

        pivot
            .terms()
            .iter()
            .map(|term| LinearQuery {
                head: Some(term.clone()),
                chain: tail.clone(),
                date: None,
            })
            .collect()
    }
}
