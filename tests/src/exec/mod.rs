mod edge_table;
