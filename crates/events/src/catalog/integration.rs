//! Painting-inventory events for external consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use brushwork_core::TenantId;

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialCreated {
    pub material_id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub category: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl Event for MaterialCreated {
    const NAME: &'static str = "MaterialCreated";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintBrandCreated {
    pub brand_id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for PaintBrandCreated {
    const NAME: &'static str = "PaintBrandCreated";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintLineCreated {
    pub line_id: Uuid,
    pub brand_id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for PaintLineCreated {
    const NAME: &'static str = "PaintLineCreated";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintColorCreated {
    pub color_id: Uuid,
    pub line_id: Uuid,
    pub name: String,
    /// `#rrggbb`
    pub hex_code: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for PaintColorCreated {
    const NAME: &'static str = "PaintColorCreated";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaintFinish {
    Matte,
    Satin,
    Gloss,
    Metallic,
    Wash,
}

/// v2 adds the finish; v1 rows stay as they were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintColorCreatedV2 {
    pub color_id: Uuid,
    pub line_id: Uuid,
    pub name: String,
    pub hex_code: String,
    pub finish: PaintFinish,
    pub occurred_at: DateTime<Utc>,
}

impl Event for PaintColorCreatedV2 {
    const NAME: &'static str = "PaintColorCreated";
    const VERSION: u16 = 2;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCategoryCreated {
    pub category_id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
}

impl Event for ModelCategoryCreated {
    const NAME: &'static str = "ModelCategoryCreated";
    const VERSION: u16 = 1;

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
