//! Build-time collection catalog.
//!
//! Every collection the application may touch is declared here together
//! with the secondary attributes it is queried by. The Structured backend
//! maintains those indexes natively; the Flat backend filters in memory.

use rustc_hash::FxHashMap;

/// One collection and its declared secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDef {
    pub name: String,
    pub indexes: Vec<String>,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, attribute: impl Into<String>) -> Self {
        self.indexes.push(attribute.into());
        self
    }

    pub fn has_index(&self, attribute: &str) -> bool {
        self.indexes.iter().any(|i| i == attribute)
    }
}

/// The set of known collections for one store namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    collections: Vec<CollectionDef>,
    /// Name → position in `collections`; the first declaration wins.
    by_name: FxHashMap<String, usize>,
}

impl Catalog {
    pub fn new(collections: Vec<CollectionDef>) -> Self {
        let mut by_name = FxHashMap::default();
        for (i, def) in collections.iter().enumerate() {
            by_name.entry(def.name.clone()).or_insert(i);
        }
        Self {
            collections,
            by_name,
        }
    }

    pub fn get(&self, name: &str) -> Option<&CollectionDef> {
        self.by_name.get(name).map(|&i| &self.collections[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn collections(&self) -> &[CollectionDef] {
        &self.collections
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        let collections = DEFAULT_COLLECTIONS
            .iter()
            .map(|(name, indexes)| CollectionDef {
                name: (*name).to_string(),
                indexes: indexes.iter().map(|i| (*i).to_string()).collect(),
            })
            .collect();
        Self::new(collections)
    }
}

/// Application collections with their indexed attributes.
const DEFAULT_COLLECTIONS: &[(&str, &[&str])] = &[
    ("cases", &["status", "clientId", "caseNumber"]),
    ("parties", &["caseId", "role"]),
    ("attorneys", &["firmId", "barNumber"]),
    ("judges", &["courtId"]),
    ("courts", &["jurisdictionId"]),
    ("jurisdictions", &[]),
    ("clients", &["status"]),
    ("matters", &["clientId", "status"]),
    ("docket_entries", &["caseId", "type"]),
    ("motions", &["caseId", "status"]),
    ("pleadings", &["caseId"]),
    ("exhibits", &["caseId", "trialId"]),
    ("evidence", &["caseId", "custodian"]),
    ("chain_of_custody", &["evidenceId"]),
    ("documents", &["caseId", "folderId"]),
    ("document_versions", &["documentId"]),
    ("folders", &["parentId"]),
    ("templates", &["category"]),
    ("clauses", &["category"]),
    ("drafts", &["caseId", "authorId"]),
    ("citations", &["documentId"]),
    ("authorities", &["type"]),
    ("research_sessions", &["userId"]),
    ("knowledge_articles", &["category"]),
    ("tasks", &["caseId", "assigneeId", "status"]),
    ("workflow_templates", &[]),
    ("workflow_instances", &["caseId", "templateId"]),
    ("case_phases", &["caseId"]),
    ("deadlines", &["caseId", "dueDate"]),
    ("calendar_events", &["caseId", "startDate"]),
    ("hearings", &["caseId", "judgeId"]),
    ("trials", &["caseId"]),
    ("witnesses", &["caseId"]),
    ("depositions", &["caseId", "witnessId"]),
    ("discovery_requests", &["caseId", "status"]),
    ("productions", &["caseId"]),
    ("privilege_logs", &["caseId"]),
    ("legal_holds", &["caseId", "status"]),
    ("custodians", &["caseId"]),
    ("interrogatories", &["caseId"]),
    ("admissions", &["caseId"]),
    ("subpoenas", &["caseId"]),
    ("settlements", &["caseId"]),
    ("judgments", &["caseId"]),
    ("appeals", &["caseId", "courtId"]),
    ("briefs", &["caseId", "appealId"]),
    ("orders", &["caseId", "judgeId"]),
    ("time_entries", &["caseId", "userId", "billed"]),
    ("expenses", &["caseId", "status"]),
    ("invoices", &["clientId", "status"]),
    ("payments", &["invoiceId"]),
    ("trust_accounts", &["clientId"]),
    ("trust_transactions", &["accountId"]),
    ("rate_tables", &[]),
    ("fee_agreements", &["clientId"]),
    ("budgets", &["matterId"]),
    ("conflict_checks", &["clientId"]),
    ("ethical_walls", &["caseId"]),
    ("compliance_rules", &["category"]),
    ("compliance_reports", &[]),
    ("audit_logs", &["userId", "entityType"]),
    ("risks", &["caseId", "severity"]),
    ("users", &["email", "role"]),
    ("roles", &[]),
    ("permissions", &["roleId"]),
    ("groups", &[]),
    ("organizations", &["type"]),
    ("legal_entities", &["type"]),
    ("contacts", &["organizationId"]),
    ("communications", &["caseId", "channel"]),
    ("correspondence", &["caseId"]),
    ("messages", &["conversationId"]),
    ("conversations", &["participantId"]),
    ("notifications", &["userId", "read"]),
    ("webhooks", &["event"]),
    ("integrations", &[]),
    ("api_keys", &["ownerId"]),
    ("reports", &["type"]),
    ("dashboards", &["ownerId"]),
    ("analytics_snapshots", &["metric"]),
    ("playbooks", &["category"]),
    ("war_room_sessions", &["caseId"]),
    ("strategy_notes", &["caseId"]),
    ("jury_pool", &["trialId"]),
    ("jury_instructions", &["trialId"]),
    ("opening_statements", &["trialId"]),
    ("closing_arguments", &["trialId"]),
    ("bluebook_entries", &["documentId"]),
    ("ocr_jobs", &["documentId", "status"]),
    ("processing_jobs", &["status"]),
    ("file_metadata", &["documentId"]),
    ("tags", &[]),
    ("comments", &["entityId"]),
    ("bookmarks", &["userId"]),
    ("saved_searches", &["userId"]),
    ("search_history", &["userId"]),
    ("projects", &["matterId"]),
    ("pipelines", &["status"]),
    ("backups", &[]),
    ("settings", &[]),
    ("sync_metadata", &[]),
];
