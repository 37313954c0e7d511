//! 管理器依赖解析
//!
//! 入度表上的 Kahn 拓扑排序。就绪队列按注册下标排序，无约束的管理器保持注册顺序，
//! 同一注册集合总是得到同一顺序。依赖未注册、重复注册或存在环时构造失败，不做部分排序。

use std::collections::{BTreeSet, HashMap};

use crate::core::HiveError;
use crate::manager::ManagerId;

/// 解析执行顺序
///
/// 输入为按注册顺序排列的 (id, 依赖列表)，返回各管理器在输入中的下标，依赖总在被依赖者之后。
pub fn resolve_order(nodes: &[(ManagerId, Vec<ManagerId>)]) -> Result<Vec<usize>, HiveError> {
    let mut index: HashMap<&ManagerId, usize> = HashMap::with_capacity(nodes.len());
    for (i, (id, _)) in nodes.iter().enumerate() {
        if index.insert(id, i).is_some() {
            return Err(HiveError::DuplicateManager(id.clone()));
        }
    }

    // 邻接表：被依赖者 -> 依赖它的管理器
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];
    for (i, (id, deps)) in nodes.iter().enumerate() {
        let mut unique: BTreeSet<usize> = BTreeSet::new();
        for dep in deps {
            let &d = index.get(dep).ok_or_else(|| HiveError::UnknownDependency {
                manager: id.clone(),
                dependency: dep.clone(),
            })?;
            unique.insert(d);
        }
        for d in unique {
            dependents[d].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != nodes.len() {
        let cyclic: Vec<ManagerId> = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].0.clone())
            .collect();
        return Err(HiveError::DependencyCycle(cyclic));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: &[&str]) -> (ManagerId, Vec<ManagerId>) {
        (
            ManagerId::new(id),
            deps.iter().map(|d| ManagerId::new(*d)).collect(),
        )
    }

    fn names(nodes: &[(ManagerId, Vec<ManagerId>)], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| nodes[i].0.to_string()).collect()
    }

    #[test]
    fn test_independent_keep_registration_order() {
        let nodes = vec![node("insight", &[]), node("personality", &[])];
        let order = resolve_order(&nodes).unwrap();
        assert_eq!(names(&nodes, &order), vec!["insight", "personality"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let nodes = vec![
            node("d", &["b", "c"]),
            node("c", &["a"]),
            node("b", &["a"]),
            node("a", &[]),
            node("e", &[]),
        ];
        let order = resolve_order(&nodes).unwrap();
        let pos = |name: &str| names(&nodes, &order).iter().position(|n| n == name).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
        assert_eq!(names(&nodes, &order), vec!["a", "c", "b", "d", "e"]);
        assert_eq!(resolve_order(&nodes).unwrap(), order);
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let nodes = vec![node("a", &[]), node("b", &["a", "a"])];
        assert_eq!(resolve_order(&nodes).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_cycle_rejected_with_members() {
        let nodes = vec![
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("free", &[]),
        ];
        match resolve_order(&nodes) {
            Err(HiveError::DependencyCycle(ids)) => {
                let ids: Vec<&str> = ids.iter().map(|i| i.as_str()).collect();
                assert_eq!(ids, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let nodes = vec![node("a", &["a"])];
        assert!(matches!(
            resolve_order(&nodes),
            Err(HiveError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let nodes = vec![node("a", &["ghost"])];
        assert!(matches!(
            resolve_order(&nodes),
            Err(HiveError::UnknownDependency { .. })
        ));
        let nodes = vec![node("a", &[]), node("a", &[])];
        assert!(matches!(
            resolve_order(&nodes),
            Err(HiveError::DuplicateManager(_))
        ));
    }
}
