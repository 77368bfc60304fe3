//! Service dependency ordering
//!
//! Depth-first traversals over the `depends_on` edges. Only required
//! dependencies force ordering; optional ones are ignored. Cycles are an
//! input error and report the offending edge.

use super::project::{Project, Service};
use crate::error::{KilnError, Result};
use std::collections::HashSet;

/// Order `services` so every service appears after its required
/// dependencies. With `expand`, required dependencies outside the given
/// subset are pulled in from the project; without it they are skipped.
pub fn ordered_by_dependencies(
    project: &Project,
    services: &[Service],
    expand: bool,
) -> Result<Vec<Service>> {
    let subset: HashSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
    let mut added: HashSet<String> = HashSet::new();
    let mut visiting: HashSet<String> = HashSet::new();
    let mut ordered = Vec::new();

    fn visit(
        project: &Project,
        service: &Service,
        subset: &HashSet<&str>,
        expand: bool,
        added: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        ordered: &mut Vec<Service>,
    ) -> Result<()> {
        visiting.insert(service.name.clone());

        for (name, dependency) in &service.depends_on {
            if !subset.contains(name.as_str()) && !expand {
                continue;
            }

            tracing::debug!(service = %service.name, on = %name, "depends");

            if dependency.required && visiting.contains(name) {
                return Err(KilnError::CyclicDependency {
                    from: service.name.clone(),
                    to: name.clone(),
                });
            }

            if !added.contains(name) && dependency.required {
                let dep = project
                    .service(name)
                    .ok_or_else(|| KilnError::ServiceNotFound(name.clone()))?;
                visit(project, dep, subset, expand, added, visiting, ordered)?;
            }
        }

        visiting.remove(&service.name);
        if added.insert(service.name.clone()) {
            ordered.push(service.clone());
        }

        Ok(())
    }

    for service in services {
        if !added.contains(&service.name) {
            visit(
                project,
                service,
                &subset,
                expand,
                &mut added,
                &mut visiting,
                &mut ordered,
            )?;
        }
    }

    Ok(ordered)
}

/// Order `services` so every service appears before its required
/// dependencies, following dependants instead of dependencies. With
/// `expand`, dependants outside the subset are pulled in from the project.
pub fn reversed_by_dependencies(
    project: &Project,
    services: &[Service],
    expand: bool,
) -> Result<Vec<Service>> {
    let subset: HashSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
    let mut added: HashSet<String> = HashSet::new();
    let mut visiting: HashSet<String> = HashSet::new();
    let mut reversed = Vec::new();

    fn visit(
        project: &Project,
        service: &Service,
        subset: &HashSet<&str>,
        expand: bool,
        added: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        reversed: &mut Vec<Service>,
    ) -> Result<()> {
        visiting.insert(service.name.clone());

        for dependant in dependants_of(project, &service.name) {
            if !subset.contains(dependant.name.as_str()) && !expand {
                continue;
            }

            tracing::debug!(service = %dependant.name, on = %service.name, "depends");

            let required = dependant
                .depends_on
                .get(&service.name)
                .map(|d| d.required)
                .unwrap_or(false);

            if required && visiting.contains(&dependant.name) {
                return Err(KilnError::CyclicDependency {
                    from: dependant.name.clone(),
                    to: service.name.clone(),
                });
            }

            if !added.contains(&dependant.name) && required {
                visit(
                    project, dependant, subset, expand, added, visiting, reversed,
                )?;
            }
        }

        visiting.remove(&service.name);
        if added.insert(service.name.clone()) {
            reversed.push(service.clone());
        }

        Ok(())
    }

    for service in services {
        if !added.contains(&service.name) {
            visit(
                project,
                service,
                &subset,
                expand,
                &mut added,
                &mut visiting,
                &mut reversed,
            )?;
        }
    }

    Ok(reversed)
}

/// Services in the project that depend on `name`
fn dependants_of<'a>(project: &'a Project, name: &str) -> Vec<&'a Service> {
    project
        .services
        .iter()
        .filter(|s| s.depends_on.contains_key(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::parser::ComposeParser;
    use std::path::Path;

    fn project_from_yaml(yaml: &str) -> Project {
        let config = ComposeParser::parse_str(yaml).unwrap();
        Project::from_config(config, Path::new("/tmp/demo"), Path::new("compose.yaml")).unwrap()
    }

    fn names(services: &[Service]) -> Vec<&str> {
        services.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_two_service_graph() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    depends_on:
      - db
  db:
    image: postgres
"#,
        );

        let all = project.get_services(&[]).unwrap();
        let ordered = ordered_by_dependencies(&project, &all, false).unwrap();
        assert_eq!(names(&ordered), vec!["db", "web"]);

        let reversed = reversed_by_dependencies(&project, &all, false).unwrap();
        assert_eq!(names(&reversed), vec!["web", "db"]);
    }

    #[test]
    fn test_chain_ordering() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    depends_on:
      - api
  api:
    image: node
    depends_on:
      - db
  db:
    image: postgres
"#,
        );

        let all = project.get_services(&[]).unwrap();
        let ordered = ordered_by_dependencies(&project, &all, true).unwrap();
        assert_eq!(names(&ordered), vec!["db", "api", "web"]);
    }

    #[test]
    fn test_expand_pulls_missing_dependencies() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    depends_on:
      - db
  db:
    image: postgres
"#,
        );

        let subset = project.get_services(&["web".to_string()]).unwrap();

        let expanded = ordered_by_dependencies(&project, &subset, true).unwrap();
        assert_eq!(names(&expanded), vec!["db", "web"]);

        let narrow = ordered_by_dependencies(&project, &subset, false).unwrap();
        assert_eq!(names(&narrow), vec!["web"]);
    }

    #[test]
    fn test_optional_dependency_not_pulled() {
        let project = project_from_yaml(
            r#"
services:
  web:
    image: nginx
    depends_on:
      db:
        required: false
  db:
    image: postgres
"#,
        );

        let subset = project.get_services(&["web".to_string()]).unwrap();
        let ordered = ordered_by_dependencies(&project, &subset, true).unwrap();
        assert_eq!(names(&ordered), vec!["web"]);
    }

    #[test]
    fn test_cycle_detected() {
        let project = project_from_yaml(
            r#"
services:
  a:
    image: a
    depends_on:
      - b
  b:
    image: b
    depends_on:
      - a
"#,
        );

        let all = project.get_services(&[]).unwrap();
        let result = ordered_by_dependencies(&project, &all, true);
        assert!(matches!(result, Err(KilnError::CyclicDependency { .. })));
    }

    #[test]
    fn test_transitive_closure_property() {
        let project = project_from_yaml(
            r#"
services:
  a:
    image: a
    depends_on: [b, c]
  b:
    image: b
    depends_on: [d]
  c:
    image: c
  d:
    image: d
"#,
        );

        let subset = project.get_services(&["a".to_string()]).unwrap();
        let ordered = ordered_by_dependencies(&project, &subset, true).unwrap();
        let got = names(&ordered);

        // Result is exactly the transitive closure of {a} under required
        // edges, with every dependency before its dependant.
        assert_eq!(got.len(), 4);
        for (before, after) in [("b", "a"), ("c", "a"), ("d", "b")] {
            let b = got.iter().position(|n| *n == before).unwrap();
            let a = got.iter().position(|n| *n == after).unwrap();
            assert!(b < a, "{} should precede {}", before, after);
        }
    }
}
