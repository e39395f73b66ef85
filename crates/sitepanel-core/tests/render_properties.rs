//! Rendering properties over the bundled persona panel.

use std::collections::BTreeMap;
use std::sync::Arc;

use sitepanel_core::{
    render, Fields, PanelError, PersonaRole, RenderPolicy, RenderRequest, RoleRegistry,
    SUMMARY_ROLE_ID,
};

fn registry() -> RoleRegistry {
    RoleRegistry::builtin().expect("builtin registry loads")
}

/// A value per placeholder that is easy to find in the output.
fn exact_fields(registry: &RoleRegistry, role_id: &str) -> Fields {
    registry
        .get(role_id)
        .unwrap()
        .placeholders()
        .iter()
        .map(|name| (name.clone(), format!("<{name}-value>")))
        .collect()
}

#[test]
fn test_exact_fields_render_every_role() {
    let registry = registry();
    let ids: Vec<String> = registry.ids().map(str::to_string).collect();
    for id in ids {
        let role = registry.get(&id).unwrap();
        let fields = exact_fields(&registry, &id);
        let prompt = render(role, &fields, RenderPolicy::Strict)
            .unwrap_or_else(|e| panic!("role {id} failed to render: {e}"));

        let text = prompt.text();
        let definition = role.definition();
        assert!(text.contains(&definition.role));
        assert!(text.contains(&definition.instruction));
        assert!(text.contains(&definition.style));
        for value in fields.values() {
            assert!(text.contains(value), "role {id} output lacks {value}");
        }
    }
}

#[test]
fn test_render_is_deterministic() {
    let registry = registry();
    let role = registry.get("historian").unwrap();
    let fields = exact_fields(&registry, "historian");
    let first = render(role, &fields, RenderPolicy::Lenient).unwrap();
    let second = render(role, &fields, RenderPolicy::Lenient).unwrap();
    assert_eq!(first.text().as_bytes(), second.text().as_bytes());
    assert_eq!(first, second);
}

#[test]
fn test_omitting_any_placeholder_names_it() {
    let registry = registry();
    let ids: Vec<String> = registry.ids().map(str::to_string).collect();
    for id in ids {
        let role = registry.get(&id).unwrap();
        let full = exact_fields(&registry, &id);
        for omitted in full.keys() {
            let mut fields = full.clone();
            fields.remove(omitted);
            match render(role, &fields, RenderPolicy::Lenient) {
                Err(PanelError::MissingField { role_id, fields }) => {
                    assert_eq!(role_id, id);
                    assert_eq!(fields, vec![omitted.clone()]);
                }
                other => panic!("role {id} without {omitted}: unexpected {other:?}"),
            }
        }
    }
}

#[test]
fn test_explorer_scenario() {
    let registry = registry();
    let fields: Fields = [
        ("coordinates", "12.3,45.6"),
        ("landform", "plateau"),
        ("ndvi", "0.42"),
        ("slope_deg", "3.1"),
        ("elevation_m", "812"),
        ("river_distance_km", "1.2"),
        ("hypothesis_summary", "possible platform mound"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let prompt = registry
        .render(&RenderRequest::new("explorer", fields), RenderPolicy::Lenient)
        .unwrap();
    let expected_input = "座標: 12.3,45.6, 地形タイプ: plateau, NDVI: 0.42, 傾斜: 3.1度, 標高: 812m, 川からの距離: 1.2km, 仮説要約: possible platform mound";
    assert_eq!(prompt.input, expected_input);

    let definition = registry.get("explorer").unwrap().definition();
    let expected = format!(
        "{}\n{}\n{}\n{}",
        definition.role, definition.instruction, definition.style, expected_input
    );
    assert_eq!(prompt.text(), expected);
}

#[test]
fn test_historian_needs_region_not_ndvi() {
    let registry = registry();
    let placeholders = registry.get("historian").unwrap().placeholders();
    assert!(placeholders.contains("region_name"));
    assert!(!placeholders.contains("ndvi"));
}

#[test]
fn test_summary_requires_all_five_opinions() {
    let registry = registry();
    let summary = registry.get(SUMMARY_ROLE_ID).unwrap();
    let full: Fields = PersonaRole::ALL
        .iter()
        .map(|p| (p.opinion_field().to_string(), format!("{p} thinks")))
        .collect();
    assert!(render(summary, &full, RenderPolicy::Strict).is_ok());

    for persona in PersonaRole::ALL {
        let mut partial = full.clone();
        partial.remove(persona.opinion_field());
        let err = render(summary, &partial, RenderPolicy::Lenient).unwrap_err();
        assert!(err.to_string().contains(persona.opinion_field()));
    }
}

#[tokio::test]
async fn test_concurrent_renders_match_sequential() {
    let registry = Arc::new(registry());
    let site_fields = sitepanel_core::SiteAttributes::new("site_000", -60.1, -3.2).to_fields();

    let sequential: BTreeMap<PersonaRole, String> = PersonaRole::ALL
        .iter()
        .map(|&p| {
            let role = registry.get(p.id()).unwrap();
            let request = RenderRequest::for_role(role, &site_fields);
            (p, registry.render(&request, RenderPolicy::Lenient).unwrap().text())
        })
        .collect();

    let mut handles = Vec::new();
    for persona in PersonaRole::ALL.into_iter().rev() {
        let registry = Arc::clone(&registry);
        let fields = site_fields.clone();
        handles.push(tokio::spawn(async move {
            let role = registry.get(persona.id()).unwrap();
            let request = RenderRequest::for_role(role, &fields);
            (persona, registry.render(&request, RenderPolicy::Lenient).unwrap().text())
        }));
    }
    let mut concurrent = BTreeMap::new();
    for handle in handles {
        let (persona, text) = handle.await.unwrap();
        concurrent.insert(persona, text);
    }

    assert_eq!(concurrent.len(), 5);
    assert_eq!(concurrent, sequential);
}
