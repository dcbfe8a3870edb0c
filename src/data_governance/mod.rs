//! # 数据治理系统 (Data Governance System)
//!
//! Safe one-shot migrations for the clinic database.
//!
//! ## 设计目标
//!
//! 1. **预演优先**：destructive migrations report their impact until confirmed
//! 2. **先备份后变更**：shadow-table backups share the mutation's transaction
//! 3. **原子性快照**：SQLite Backup API snapshot before confirmed mutations
//! 4. **可追溯**：every reclassified row lands in a CSV audit trail
//!
//! ## 模块结构
//!
//! - `migration`: engine components and the coordinator
//! - `backup`: whole-database snapshots
//! - `audit`: CSV audit trail

pub mod audit;
pub mod backup;
pub mod migration;
