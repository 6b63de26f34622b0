//! Opportunity categorisation for the paid-traffic view.

use crate::Opportunity;

pub const PAID_MEDIA_TAG: &str = "paid media";
pub const CWV_TYPE: &str = "cwv";
pub const CONSENT_BANNER_TYPE: &str = "consent-banner";
pub const NO_CTA_ABOVE_THE_FOLD: &str = "no-cta-above-the-fold";

pub const FORM_OPPORTUNITY_TYPES: [&str; 4] = [
    "form-accessibility",
    "high-form-views-low-conversions",
    "high-page-views-low-form-nav",
    "high-page-views-low-form-views",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    NoProjectedValue,
    MissingDescription,
    ReportTitle,
    UnsupportedType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Always relevant to paid traffic; no URL matching needed.
    PaidMedia,
    Cwv,
    Forms,
    Excluded(ExclusionReason),
}

impl Category {
    pub fn needs_url_matching(self) -> bool {
        matches!(self, Category::Cwv | Category::Forms)
    }

    pub fn is_excluded(self) -> bool {
        matches!(self, Category::Excluded(_))
    }
}

/// Decide how an opportunity takes part in the paid-traffic ranking.
///
/// Status is not a filter here; it only narrows what the data layer returns.
/// Rules apply in order, first match wins.
pub fn classify(opportunity: &Opportunity) -> Category {
    if opportunity.projected_value().is_none() {
        return Category::Excluded(ExclusionReason::NoProjectedValue);
    }

    let has_description = opportunity
        .description
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty());
    if !has_description {
        return Category::Excluded(ExclusionReason::MissingDescription);
    }

    if opportunity.title.to_lowercase().contains("report") {
        return Category::Excluded(ExclusionReason::ReportTitle);
    }

    if opportunity.has_tag(PAID_MEDIA_TAG) {
        return Category::PaidMedia;
    }

    let kind = opportunity.opportunity_type.as_str();
    if kind == CWV_TYPE {
        return Category::Cwv;
    }

    if kind == CONSENT_BANNER_TYPE
        || opportunity.data.opportunity_type.as_deref() == Some(NO_CTA_ABOVE_THE_FOLD)
    {
        return Category::PaidMedia;
    }

    if FORM_OPPORTUNITY_TYPES.contains(&kind) {
        return Category::Forms;
    }

    Category::Excluded(ExclusionReason::UnsupportedType)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OpportunityData;
    use uuid::Uuid;

    fn opp(kind: &str, title: &str, value: Option<f64>) -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            title: title.to_string(),
            description: Some("Something to fix".into()),
            opportunity_type: kind.to_string(),
            status: "NEW".into(),
            tags: vec![],
            data: OpportunityData {
                projected_traffic_value: value,
                ..Default::default()
            },
        }
    }

    #[test]
    fn paid_media_tag_wins_over_type() {
        let mut o = opp("broken-backlinks", "Fix links", Some(100.0));
        o.tags = vec!["Paid Media".into()];
        assert_eq!(classify(&o), Category::PaidMedia);
    }

    #[test]
    fn missing_or_zero_value_is_excluded() {
        let o = opp("cwv", "Improve LCP", None);
        assert_eq!(classify(&o), Category::Excluded(ExclusionReason::NoProjectedValue));
        let mut o = opp("cwv", "Improve LCP", Some(0.0));
        o.tags = vec!["paid media".into()];
        assert_eq!(classify(&o), Category::Excluded(ExclusionReason::NoProjectedValue));
        assert!(classify(&o).is_excluded());
        assert!(!classify(&o).needs_url_matching());
    }

    #[test]
    fn conversion_value_counts_as_projected_value() {
        let mut o = opp("form-accessibility", "Accessible forms", None);
        o.data.projected_conversion_value = Some(50.0);
        assert_eq!(classify(&o), Category::Forms);
        assert!(!classify(&o).is_excluded());
    }

    #[test]
    fn blank_description_is_excluded() {
        let mut o = opp("cwv", "Improve LCP", Some(10.0));
        o.description = Some("   ".into());
        assert_eq!(classify(&o), Category::Excluded(ExclusionReason::MissingDescription));
        o.description = None;
        assert_eq!(classify(&o), Category::Excluded(ExclusionReason::MissingDescription));
    }

    #[test]
    fn report_titles_are_excluded_in_any_case() {
        let mut o = opp("cwv", "Weekly REPORT summary", Some(10.0));
        o.tags = vec!["paid media".into()];
        assert_eq!(classify(&o), Category::Excluded(ExclusionReason::ReportTitle));
    }

    #[test]
    fn type_rules() {
        assert_eq!(classify(&opp("cwv", "LCP", Some(1.0))), Category::Cwv);
        assert_eq!(classify(&opp("consent-banner", "Banner", Some(1.0))), Category::PaidMedia);
        for kind in FORM_OPPORTUNITY_TYPES {
            assert_eq!(classify(&opp(kind, "Form", Some(1.0))), Category::Forms);
        }
        assert_eq!(
            classify(&opp("broken-backlinks", "Links", Some(1.0))),
            Category::Excluded(ExclusionReason::UnsupportedType)
        );

        let mut generic = opp("generic-opportunity", "CTA", Some(1.0));
        generic.data.opportunity_type = Some(NO_CTA_ABOVE_THE_FOLD.into());
        assert_eq!(classify(&generic), Category::PaidMedia);
    }

    #[test]
    fn status_does_not_filter() {
        let mut o = opp("cwv", "LCP", Some(1.0));
        o.status = "RESOLVED".into();
        assert_eq!(classify(&o), Category::Cwv);
        assert!(classify(&o).needs_url_matching());
    }
}
